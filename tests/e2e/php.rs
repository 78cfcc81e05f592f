//! PHP buildpack scenarios.

use std::time::Duration;

use regex::Regex;

use stagehand::{AppGuard, Result, WorkerContext};

use super::{
    assert_no_internet_traffic, assert_uses_proxy_during_staging, dependency_host, guarded,
    skip_unless_cached, skip_unless_uncached, Scenario,
};

const CAKE_START: &str =
    "$HOME/bin/cake migrations migrate && procmgr /home/vcap/deps/org.cloudfoundry.php-web/php-web/procs.yml";

/// Guarded fixture with the operator's log level forwarded.
fn php_app(ctx: &WorkerContext, fixture: &str, log_var: &str) -> AppGuard {
    let mut app = guarded(ctx, &[fixture]);
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        app.set_env(log_var, &level);
    }
    app
}

#[tokio::test]
async fn test_php_app_installs_configured_runtime() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let mut app = guarded(ctx, &["php_app"]);
    app.set_env("BP_DEBUG", "1");

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        let contributed = Regex::new(r"PHP.*7\.2\.\d+.*Contributing.* to layer").unwrap();
        ctx.driver()
            .wait_for_log_match(&*app, &contributed, Duration::from_secs(10))
            .await?;

        let response = app.get("/", &[]).await?;
        assert!(response.body.contains("PHP Version"));
        assert!(!response.has_header("X-Powered-By"));

        if ctx.config().cached {
            let reused = Regex::new(r"Reusing.*cached download from buildpack").unwrap();
            assert!(app.output().matches(&reused));
        }
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    assert_no_internet_traffic(ctx, &["php_app"]).await;
    scenario.finish().await;
}

#[tokio::test]
async fn test_nginx_serves_php_app() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let app = php_app(ctx, "with_nginx", "LOG_LEVEL");

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        let announced = format!("-----> Php Buildpack version {}", ctx.shared().buildpack.version);
        assert!(app.output().contains(&announced));
        let nginx = Regex::new(r"Nginx Server.*1\.\d+\.\d+.*Contributing.* to layer").unwrap();
        assert!(app.output().matches(&nginx));
        assert!(app.get_body("/").await?.contains("PHP Version"));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_unsupported_extensions_only_warn() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let app = php_app(ctx, "unsupported_extensions", "BP_DEBUG");

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        for extension in ["hotdog", "meatball"] {
            let warning = format!(
                "NOTICE: PHP message: PHP Warning:  PHP Startup: Unable to load dynamic library '{}.so'",
                extension
            );
            assert!(app.output().contains(&warning), "no startup warning for {}", extension);
        }
        assert!(app
            .get_body("/")
            .await?
            .contains("curl module has been loaded successfully"));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

/// Push a Cake fixture that migrates its database on start.
async fn cake_app_serves_users(ctx: &WorkerContext, fixture: &str) {
    let mut app = guarded(ctx, &[fixture]);
    app.settings.start_command = Some(CAKE_START.to_string());

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        let body = app.get_body("/").await?;
        assert!(body.contains("CakePHP"));
        assert!(!body.contains("Missing Database Table"));
        assert!(app.get_body("/users/add").await?.contains("Add User"));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
}

#[tokio::test]
async fn test_cake_app_with_local_dependencies() {
    let scenario = Scenario::start().await;
    if !skip_unless_cached(scenario.ctx()) {
        cake_app_serves_users(scenario.ctx(), "cake_local_deps").await;
    }
    scenario.finish().await;
}

#[tokio::test]
async fn test_cake_app_with_remote_dependencies() {
    let scenario = Scenario::start().await;
    if !skip_unless_uncached(scenario.ctx()) {
        cake_app_serves_users(scenario.ctx(), "cake_remote_deps").await;
    }
    scenario.finish().await;
}

#[tokio::test]
async fn test_symfony_21_app_with_local_dependencies() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    if skip_unless_cached(ctx) {
        return scenario.finish().await;
    }
    let app = guarded(ctx, &["symfony_2_local_deps"]);

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        assert!(app.get_body("/").await?.contains("Running on Symfony!"));
        assert!(app
            .get_body("/hello/foo")
            .await?
            .contains("Hello foo!\n\nRunning on Symfony!"));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

/// Uncached Symfony fixtures render their root route dynamically.
async fn symfony_remote_app_renders(ctx: &WorkerContext, fixture: &str, disk: Option<&str>) {
    let mut app = guarded(ctx, &[fixture]);
    if let Some(disk) = disk {
        app.settings.disk = Some(disk.to_string());
    }

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        assert!(app.get_body("/").await?.contains("Running on Symfony!"));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
}

#[tokio::test]
async fn test_symfony_21_app_with_remote_dependencies() {
    let scenario = Scenario::start().await;
    if !skip_unless_uncached(scenario.ctx()) {
        symfony_remote_app_renders(scenario.ctx(), "symfony_2_remote_deps", None).await;
    }
    scenario.finish().await;
}

#[tokio::test]
async fn test_symfony_28_app() {
    let scenario = Scenario::start().await;
    if !skip_unless_uncached(scenario.ctx()) {
        symfony_remote_app_renders(scenario.ctx(), "symfony_28_remote_deps", Some("512M")).await;
    }
    scenario.finish().await;
}

#[tokio::test]
async fn test_staging_downloads_use_proxy() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    if skip_unless_uncached(ctx) {
        return scenario.finish().await;
    }
    let host = dependency_host(ctx);
    for fixture in ["cake_local_deps", "symfony_2_local_deps"] {
        assert_uses_proxy_during_staging(ctx, &[fixture], host.as_deref()).await;
    }
    scenario.finish().await;
}
