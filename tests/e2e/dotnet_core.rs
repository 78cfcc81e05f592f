//! .NET Core buildpack scenarios.

use std::time::Duration;

use regex::Regex;

use stagehand::Result;

use super::{
    assert_no_internet_traffic, guarded, skip, skip_unless_cached, skip_unless_stack,
    skip_unless_uncached, Scenario,
};

#[tokio::test]
async fn test_simple_source_app() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let app = guarded(ctx, &["simple_3.1_source"]);

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        assert!(app.get_body("/").await?.contains("Hello World!"));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_self_contained_solution_runs() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let app = guarded(ctx, &["self_contained_solution_2.2"]);

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        assert!(app.get_body("/").await?.contains("Hello World!"));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_runtimeconfig_with_comments_deploys() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let app = guarded(ctx, &["runtimeconfig_with_comments"]);

    let outcome = ctx.driver().push_and_confirm(&*app).await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

/// Stacks a vendored fixture runs on.
enum Stacks {
    Only(&'static str),
    Except(&'static str),
}

/// Cached suites serve vendored apps and stage them without the network.
async fn vendored_app_serves_homepage(fixture: &str, stacks: Stacks, body: &str) {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let unsupported = match stacks {
        Stacks::Only(stack) => skip_unless_stack(ctx, stack),
        Stacks::Except(stack) if ctx.config().stack == stack => {
            skip(&format!("{} does not run on {}", fixture, stack));
            true
        }
        Stacks::Except(_) => false,
    };
    if skip_unless_cached(ctx) || unsupported {
        return scenario.finish().await;
    }
    let mut app = guarded(ctx, &[fixture]);
    app.settings.disk = Some("2G".to_string());

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        assert!(app.get_body("/").await?.contains(body));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    assert_no_internet_traffic(ctx, &[fixture]).await;
    scenario.finish().await;
}

#[tokio::test]
async fn test_portable_vendored_app() {
    vendored_app_serves_homepage("fdd_asp_vendored_2.1", Stacks::Only("cflinuxfs3"), "Hello World!")
        .await;
}

#[tokio::test]
async fn test_self_contained_vendored_app() {
    vendored_app_serves_homepage("self_contained_2.1", Stacks::Only("cflinuxfs3"), "Hello World!")
        .await;
}

#[tokio::test]
async fn test_self_contained_preview_app() {
    vendored_app_serves_homepage("self_contained_3.0", Stacks::Except("cflinuxfs2"), "Welcome").await;
}

#[tokio::test]
#[ignore = "pending"]
async fn test_global_json_pins_latest_sdk() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let sdk = ctx
        .shared()
        .buildpack
        .manifest()
        .and_then(|m| m.latest_matching("dotnet-sdk", "2.1.x"))
        .unwrap();

    let mut copy = ctx.copy_fixture(&["source_2.1_global_json_templated"]).unwrap();
    copy.replace_template("global.json", "sdk_version", &sdk).unwrap();
    let app = ctx.guard(ctx.app_from_copy(copy));

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        ctx.driver()
            .wait_for_log(&*app, &format!("Installing dotnet-sdk {}", sdk), Duration::from_secs(10))
            .await?;
        assert!(app.get_body("/").await?.contains("Hello World!"));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
async fn test_second_push_reuses_cached_sdk() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    if skip_unless_uncached(ctx) {
        return scenario.finish().await;
    }
    let mut app = guarded(ctx, &["source_2.1_float_runtime"]);
    app.settings.buildpacks = vec!["dotnet_core_buildpack".to_string()];

    let downloaded = Regex::new(r"Downloading from .*/dotnet-sdk..*\.tar\.xz").unwrap();
    let reused = Regex::new(r"Reusing cached download from previous build").unwrap();

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        assert!(app.output().matches(&downloaded));
        assert!(!app.output().matches(&reused));

        app.output().reset();
        ctx.driver().push_and_confirm(&*app).await?;
        assert!(!app.output().matches(&downloaded));
        assert_eq!(app.output().count_matches(&reused), 3);
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
#[ignore = "pending"]
async fn test_aspnetcore_app_stops_gracefully() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let app = guarded(ctx, &["aspnetcore_app_2.1"]);

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        ctx.driver()
            .stop_gracefully(&*app, "Goodbye, cruel world!", Duration::from_secs(30))
            .await
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}
