//! Python buildpack scenarios.

use regex::Regex;

use stagehand::Result;

use super::{skip_unless_uncached, Scenario};

#[tokio::test]
#[ignore = "pending"]
async fn test_second_push_copies_cached_interpreter() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    if skip_unless_uncached(ctx) {
        return scenario.finish().await;
    }
    let mut app = ctx.guard(ctx.app(&["no_deps"]).unwrap());
    app.settings.buildpacks = vec!["python_buildpack".to_string()];

    let archive = r"\[.*/python\-[\d\.]+\-linux\-x64\-(cflinuxfs.*-)?[\da-f]+\.tgz\]";
    let downloaded = Regex::new(&format!("Download {}", archive)).unwrap();
    let copied = Regex::new(&format!("Copy {}", archive)).unwrap();

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        assert!(app.output().matches(&downloaded));

        app.output().reset();
        ctx.driver().push_and_confirm(&*app).await?;
        assert!(!app.output().matches(&downloaded));
        assert!(app.output().matches(&copied));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}

#[tokio::test]
#[ignore = "pending"]
async fn test_miniconda_environment_updates_between_pushes() {
    let scenario = Scenario::start().await;
    let ctx = scenario.ctx();
    let copy = ctx.copy_fixture(&["miniconda_python_3"]).unwrap();
    let mut app = ctx.guard(ctx.app_from_copy(copy));
    app.settings.disk = Some("2G".to_string());
    app.settings.memory = Some("1G".to_string());

    let outcome: Result<()> = async {
        ctx.driver().push_and_confirm(&*app).await?;
        assert!(app.get_body("/").await?.contains("numpy: 1.15.2"));

        if let Some(copy) = app.working_copy() {
            copy.replace_text("environment.yml", "numpy=1.15.2", "numpy=1.15.0")?;
        }
        ctx.driver().push_and_confirm(&*app).await?;
        assert!(app.get_body("/").await?.contains("numpy: 1.15.0"));
        Ok(())
    }
    .await;
    app.finish(outcome).await.unwrap();
    scenario.finish().await;
}
