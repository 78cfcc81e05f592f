//! Node.js buildpack scenarios.

use std::time::Duration;

use regex::Regex;

use stagehand::droplet::assert_droplet_excludes;
use stagehand::http::STATUS_CODE_HEADER;
use stagehand::platform::ApiCapability;
use stagehand::Result;

use super::{
    assert_no_internet_traffic, assert_uses_proxy_during_staging, guarded, skip_unless_cached,
    skip_unless_supported, Scenario,
};

const LOG_WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_node_version_range_resolves() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let app = guarded(ctx, &["node_version_range"]);
    let has_tasks = !skip_unless_supported(ctx, ApiCapability::Tasks).await;

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        let installed = Regex::new(r"Installing Node Engine \d+\.\d+\.\d+").unwrap();
        ctx.driver().wait_for_log_match(&*app, &installed, LOG_WAIT).await?;
        assert!(app.get_body("/").await?.contains("Hello, World!"));

        if has_tasks {
            app.run_task("echo \"RUNNING A TASK: $(node --version)\"").await?;
            let task = Regex::new(r"RUNNING A TASK: v\d+\.\d+\.\d+").unwrap();
            ctx.driver()
                .wait_for_log_match(&*app, &task, Duration::from_secs(30))
                .await?;
        }
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_without_node_version_uses_default() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let app = guarded(ctx, &["without_node_version"]);

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        let installed = Regex::new(r"Installing Node Engine 10\.\d+\.\d+").unwrap();
        ctx.driver().wait_for_log_match(&*app, &installed, LOG_WAIT).await?;
        assert!(app.get_body("/").await?.contains("Hello, World!"));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_unreleased_node_version_fails_cleanly() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let app = guarded(ctx, &["unreleased_node_version"]);

    let outcome: Result<()> = async {
        let mut driver = ctx.driver().clone();
        driver.logs.timeout = Duration::from_secs(2);
        driver
            .expect_push_failure(
                &*app,
                &[r#"failed to satisfy "node" dependency version constraint "9000.0.0": no compatible versions"#],
            )
            .await?;
        driver.confirm_buildpack(&*app, &ctx.shared().buildpack.version)
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_unsupported_node_version_fails_cleanly() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let app = guarded(ctx, &["unsupported_node_version"]);

    let outcome: Result<()> = async {
        let mut driver = ctx.driver().clone();
        driver.logs.timeout = Duration::from_secs(2);
        driver
            .expect_push_failure(
                &*app,
                &[r#"failed to satisfy "node" dependency version constraint "4.1.1": no compatible versions"#],
            )
            .await?;
        driver.confirm_buildpack(&*app, &ctx.shared().buildpack.version)
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_optimize_memory_autosizes_heap() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let mut app = guarded(ctx, &["simple_app"]);
    app.settings.memory = Some("128M".to_string());
    app.set_env("OPTIMIZE_MEMORY", "true");

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        let body = app.get_body("/").await?;
        assert!(body.contains("NodeOptions: --max_old_space_size=96"), "{}", body);
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_default_memory_leaves_node_options_unset() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();

    for fixture in ["simple_app", "simple_app_with_nvmrc"] {
        let app = guarded(ctx, &[fixture]);
        let outcome: Result<()> = async {
            ctx.driver().push_and_confirm(&*app).await?;
            let body = app.get_body("/").await?;
            assert!(body.contains("NodeOptions: undefined"), "{}: {}", fixture, body);
            Ok(())
        }
        .await;
        app.finish(outcome).await.unwrap();
    }
    scenario.finish().await;
}

#[tokio::test]
async fn test_vendored_dependencies_are_rebuilt() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let app = guarded(ctx, &["vendored_dependencies"]);

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        assert!(app
            .output()
            .ansi_stripped()
            .contains("Selected NPM build process: 'npm rebuild'"));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_vendored_dependencies_stage_offline() {
    let scenario = Scenario::start().await;
    assert_no_internet_traffic(scenario.ctx(), &["vendored_dependencies"]).await;
    scenario.finish().await;
}

#[tokio::test]
async fn test_vendored_module_binaries_deploy() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    if skip_unless_supported(ctx, ApiCapability::Symlinks).await {
        return scenario.finish().await;
    }
    let app = guarded(ctx, &["vendored_dependencies_with_binaries"]);
    let outcome = ctx.driver().push_and_confirm(&*app).await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_yarn_vendored_runs_offline() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    if skip_unless_cached(ctx) {
        return scenario.finish().await;
    }
    let app = guarded(ctx, &["with_yarn_vendored"]);

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        assert!(app.path().join("node_modules").is_dir());
        ctx.driver()
            .wait_for_log(&*app, "Running yarn in offline mode", LOG_WAIT)
            .await?;
        let native = Regex::new(r"native time: \d+\.\d+").unwrap();
        assert!(native.is_match(&app.get_body("/microtime").await?));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    assert_no_internet_traffic(ctx, &["with_yarn_vendored"]).await;
    scenario.finish().await;
}

#[tokio::test]
async fn test_incomplete_package_json_keeps_vendored_modules() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let app = guarded(ctx, &["incomplete_package_json"]);

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        let files = app.files(".").await?;
        for module in ["node_modules/leftpad", "node_modules/hashish", "node_modules/traverse"] {
            assert!(files.iter().any(|f| f.contains(module)), "missing {}", module);
        }
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_dependencies_are_installed_at_staging() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();

    for (fixture, process) in [
        ("no_vendored_dependencies", "Selected NPM build process: 'npm install'"),
        ("with_yarn", "Selected default build process: 'yarn install'"),
    ] {
        let app = guarded(ctx, &[fixture]);
        let outcome: Result<()> = async {
            ctx.driver().push_and_confirm(&*app).await?;
            assert!(!app.path().join("node_modules").is_dir());
            ctx.driver().wait_for_log(&*app, process, LOG_WAIT).await?;
            assert!(app.get_body("/").await?.contains("Hello, World!"));
            Ok(())
        }
        .await;
        app.finish(outcome).await.unwrap();
    }
    scenario.finish().await;
}

#[tokio::test]
async fn test_staging_downloads_use_proxy() {
    let scenario = Scenario::start().await;
    // npm and yarn registries are fetched as well as buildpack dependencies.
    for fixture in ["no_vendored_dependencies", "with_yarn"] {
        assert_uses_proxy_during_staging(scenario.ctx(), &[fixture], None).await;
    }
    scenario.finish().await;
}

#[tokio::test]
async fn test_pre_and_post_scripts_run() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let app = guarded(ctx, &["pre_post_commands"]);

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        let body = app.get_body("/").await?;
        assert!(body.contains("Text: Hello Buildpacks Team"));
        assert!(body.contains("Text: Goodbye Buildpacks Team"));
        assert!(body.contains("Current dir: /home/vcap/app"));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_node_home_and_env() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let mut app = guarded(ctx, &["logenv"]);
    app.settings.memory = Some("128M".to_string());

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        let body = app.get_body("/").await?;
        assert!(Regex::new(r#""NODE_HOME":"[^"]*/node""#).unwrap().is_match(&body));
        assert!(body.contains(r#""NODE_ENV":"production""#));
        assert!(body.contains(r#""MEMORY_AVAILABLE":"128""#));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_profile_script_runs_and_is_not_served() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let app = guarded(ctx, &["with_profile_script"]);

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        app.get_body("/").await?;
        assert!(app.output().contains("PROFILE_SCRIPT_IS_PRESENT_AND_RAN"));
        let response = app.get("/.profile", &[]).await?;
        assert_eq!(response.header(STATUS_CODE_HEADER), Some(&["404".to_string()][..]));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_app_env_is_not_saved_in_droplet() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let mut app = guarded(ctx, &["simple_app"]);
    app.set_env("APP_ENV_VAR", "SUPER SECRET SECRET");

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        let scratch = tempfile::tempdir()?;
        let droplet = scratch.path().join("droplet.tgz");
        app.download_droplet(&droplet).await?;
        assert_droplet_excludes(&droplet, &["SUPER SECRET SECRET"])
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_system_ca_store_is_used() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let mut app = guarded(ctx, &["use-openssl-ca"]);
    app.set_env("SSL_CERT_FILE", "cert.pem");

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        assert!(app
            .get_body("/")
            .await?
            .contains("Response over self signed https"));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}
