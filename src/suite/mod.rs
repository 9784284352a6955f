//! Test-suite runner
//!
//! A suite brings a cluster up with an external creator (`kops` or
//! `eksctl`), runs the user's snippets against it and tears it down. The
//! order is fixed: `init`, `build`, `up`, `install`, `test`, `uninstall`,
//! `tear_down`. Once `up` has been attempted, `uninstall` and `tear_down`
//! always run, on a token of their own so an interrupted suite still
//! cleans up.

pub mod config;
mod eks;
mod kops;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ekstest_common::exec::{CommandRunner, CommandSpec};
use ekstest_common::poll::until_cancelled;
use ekstest_common::{CancellationToken, Error, Result};
use futures::future::BoxFuture;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{error, info};

pub use config::{substitute_test_id, ClusterSpec, EksConfig, KopsConfig, TestConfig};
pub use eks::{extract_binary, EksctlCreator};
pub use kops::{patch_cluster_spec, KopsCreator};

/// Budget of one user snippet
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);

const TEST_ID_LEN: usize = 8;

/// One opaque unit of suite work
#[async_trait]
pub trait Step: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Do the work
    async fn run(&self, cancel: &CancellationToken) -> Result<()>;
}

type StepFn = dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// [`Step`] backed by a closure
pub struct FnStep {
    name: String,
    f: Box<StepFn>,
}

impl FnStep {
    /// Step named `name` running `f`
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl Step for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        (self.f)(cancel.clone()).await
    }
}

/// Brings one cluster up and down
pub trait ClusterCreator: Send + Sync {
    /// Fetch tools and prepare local files
    fn init(&self) -> Box<dyn Step>;
    /// Create the cluster and write its credential file
    fn up(&self) -> Box<dyn Step>;
    /// Delete the cluster
    fn tear_down(&self) -> Box<dyn Step>;
    /// Variables handed to every user snippet
    fn env(&self) -> Vec<(String, String)>;
}

/// What every creator shares
#[derive(Clone)]
pub struct SuiteContext {
    /// Runs the creator binaries and the snippets
    pub runner: Arc<dyn CommandRunner>,
    /// Downloads land here
    pub http: reqwest::Client,
    /// Binaries, keys and the credential file
    pub workdir: PathBuf,
    /// Per-run identifier
    pub test_id: String,
}

impl std::fmt::Debug for SuiteContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuiteContext")
            .field("workdir", &self.workdir)
            .field("test_id", &self.test_id)
            .finish_non_exhaustive()
    }
}

impl SuiteContext {
    /// Credential file written by `up`
    pub fn kubeconfig(&self) -> PathBuf {
        self.workdir.join("kubeconfig")
    }

    /// Install path of a downloaded tool
    pub fn bin(&self, name: &str) -> PathBuf {
        self.workdir.join("bin").join(name)
    }

    /// Run `spec`; a non-zero exit is an error carrying the full output
    pub(crate) async fn exec(&self, spec: CommandSpec, cancel: &CancellationToken) -> Result<String> {
        info!(command = %spec, "running");
        let name = spec.program.clone();
        let out = until_cancelled(&name, cancel, self.runner.run(spec.clone()))
            .await?
            .check(&spec, true)?;
        Ok(out.stdout)
    }
}

/// Random lowercase alphanumeric run id
pub fn generate_test_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TEST_ID_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Creator selected by the suite's cluster block
pub fn creator(cfg: &TestConfig, ctx: SuiteContext) -> Result<Box<dyn ClusterCreator>> {
    match (&cfg.cluster.kops, &cfg.cluster.eks) {
        (Some(kops), None) => Ok(Box::new(KopsCreator::new(
            kops.clone(),
            cfg.region.clone(),
            ctx,
        ))),
        (None, Some(eks)) => {
            let mut eks = eks.clone();
            if eks.region.is_empty() {
                eks.region = cfg.region.clone();
            }
            Ok(Box::new(EksctlCreator::new(eks, ctx)))
        }
        _ => Err(Error::invalid_config("cluster", "set exactly one of kops or eks")),
    }
}

/// Runs one suite end to end
pub struct SuiteRunner {
    cfg: TestConfig,
    ctx: SuiteContext,
    creator: Box<dyn ClusterCreator>,
}

impl std::fmt::Debug for SuiteRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuiteRunner")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl SuiteRunner {
    /// Runner for `cfg` working under `workdir` with a fresh test id
    pub fn new(cfg: TestConfig, runner: Arc<dyn CommandRunner>, workdir: &Path) -> Result<Self> {
        let ctx = SuiteContext {
            runner,
            http: reqwest::Client::new(),
            workdir: workdir.to_path_buf(),
            test_id: generate_test_id(),
        };
        let creator = creator(&cfg, ctx.clone())?;
        Ok(Self { cfg, ctx, creator })
    }

    /// Runner with an explicit creator
    pub fn with_creator(cfg: TestConfig, ctx: SuiteContext, creator: Box<dyn ClusterCreator>) -> Self {
        Self { cfg, ctx, creator }
    }

    /// Identifier substituted for `{{TEST_ID}}`
    pub fn test_id(&self) -> &str {
        &self.ctx.test_id
    }

    async fn step(&self, step: Box<dyn Step>, cancel: &CancellationToken) -> Result<()> {
        info!(step = step.name(), test_id = %self.ctx.test_id, "starting");
        let result = step.run(cancel).await;
        match &result {
            Ok(()) => info!(step = step.name(), "finished"),
            Err(e) => error!(step = step.name(), error = %e, "failed"),
        }
        result
    }

    async fn script(&self, name: &str, snippet: &str, cancel: &CancellationToken) -> Result<()> {
        if snippet.trim().is_empty() {
            info!(step = name, "no snippet configured");
            return Ok(());
        }
        let spec = CommandSpec::shell(substitute_test_id(snippet, &self.ctx.test_id))
            .env("TEST_ID", &self.ctx.test_id)
            .envs(self.creator.env())
            .timeout(SCRIPT_TIMEOUT);
        info!(step = name, "running snippet");
        let stdout = self.ctx.exec(spec, cancel).await?;
        info!(step = name, output = %stdout.trim_end(), "snippet finished");
        Ok(())
    }

    /// Run every phase; the first failure is returned
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        self.step(self.creator.init(), cancel).await?;
        self.script("build", &self.cfg.build, cancel).await?;

        let mut errors = Vec::new();
        let tested = match self.step(self.creator.up(), cancel).await {
            Ok(()) => match self.script("install", &self.cfg.install, cancel).await {
                Ok(()) => self.script("test", &self.cfg.test, cancel).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = tested {
            errors.push(e);
        }

        let cleanup = CancellationToken::new();
        if let Err(e) = self.script("uninstall", &self.cfg.uninstall, &cleanup).await {
            errors.push(e);
        }
        if let Err(e) = self.step(self.creator.tear_down(), &cleanup).await {
            errors.push(e);
        }

        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => {
                info!(test_id = %self.ctx.test_id, "suite passed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ekstest_common::exec::{CommandOutput, MockCommandRunner};
    use futures::FutureExt;
    use std::sync::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct RecordingCreator {
        journal: Journal,
        fail_up: bool,
    }

    impl RecordingCreator {
        fn step(&self, name: &'static str, fail: bool) -> Box<dyn Step> {
            let journal = self.journal.clone();
            Box::new(FnStep::new(name, move |_| {
                let journal = journal.clone();
                async move {
                    journal.lock().unwrap().push(name.to_string());
                    if fail {
                        Err(Error::command(name, "exit status 1"))
                    } else {
                        Ok(())
                    }
                }
                .boxed()
            }))
        }
    }

    impl ClusterCreator for RecordingCreator {
        fn init(&self) -> Box<dyn Step> {
            self.step("init", false)
        }
        fn up(&self) -> Box<dyn Step> {
            self.step("up", self.fail_up)
        }
        fn tear_down(&self) -> Box<dyn Step> {
            self.step("tear-down", false)
        }
        fn env(&self) -> Vec<(String, String)> {
            vec![("KUBECONFIG".to_string(), "/tmp/kc".to_string())]
        }
    }

    fn suite() -> TestConfig {
        TestConfig {
            build: "make build TAG={{TEST_ID}}".to_string(),
            install: "make install".to_string(),
            uninstall: "make uninstall".to_string(),
            test: "make test".to_string(),
            ..Default::default()
        }
    }

    /// Shell runner journaling the snippet; snippets containing `failing` exit 2
    fn shell(journal: Journal) -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(move |spec| {
            assert_eq!(spec.program, "sh");
            assert!(spec.has_arg("-eu"));
            assert!(spec.env.iter().any(|(k, _)| k == "KUBECONFIG"));
            let script = spec.args.last().cloned().unwrap_or_default();
            journal.lock().unwrap().push(script.clone());
            if script.contains("failing") {
                Ok(CommandOutput::failed(2, "make: *** [test] Error 2"))
            } else {
                Ok(CommandOutput::ok("ok\n"))
            }
        });
        runner
    }

    fn runner(cfg: TestConfig, fail_up: bool) -> (SuiteRunner, Journal) {
        let journal: Journal = Arc::default();
        let ctx = SuiteContext {
            runner: Arc::new(shell(journal.clone())),
            http: reqwest::Client::new(),
            workdir: PathBuf::from("/tmp/suite"),
            test_id: "abc123xy".to_string(),
        };
        let creator = RecordingCreator {
            journal: journal.clone(),
            fail_up,
        };
        (SuiteRunner::with_creator(cfg, ctx, Box::new(creator)), journal)
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    #[tokio::test]
    async fn test_phases_run_in_order() {
        let (runner, journal) = runner(suite(), false);
        runner.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "init",
                "make build TAG=abc123xy",
                "up",
                "make install",
                "make test",
                "make uninstall",
                "tear-down",
            ]
        );
    }

    #[tokio::test]
    async fn story_failed_test_still_uninstalls_and_tears_down() {
        let mut cfg = suite();
        cfg.test = "make failing-test".to_string();
        let (runner, journal) = runner(cfg, false);

        let err = runner.run(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("Error 2"));
        let journal = journal.lock().unwrap();
        assert_eq!(journal[journal.len() - 2], "make uninstall");
        assert_eq!(journal[journal.len() - 1], "tear-down");
    }

    #[tokio::test]
    async fn test_failed_up_skips_install_but_tears_down() {
        let (runner, journal) = runner(suite(), true);
        runner.run(&CancellationToken::new()).await.unwrap_err();
        let journal = journal.lock().unwrap();
        assert!(!journal.contains(&"make install".to_string()));
        assert!(!journal.contains(&"make test".to_string()));
        assert_eq!(journal.last().map(String::as_str), Some("tear-down"));
    }

    #[tokio::test]
    async fn test_failed_build_never_creates_a_cluster() {
        let mut cfg = suite();
        cfg.build = "make failing-build".to_string();
        let (runner, journal) = runner(cfg, false);
        runner.run(&CancellationToken::new()).await.unwrap_err();
        let journal = journal.lock().unwrap();
        assert!(!journal.contains(&"up".to_string()));
        assert!(!journal.contains(&"tear-down".to_string()));
    }

    #[tokio::test]
    async fn test_empty_snippets_are_skipped() {
        let (runner, journal) = runner(TestConfig::default(), false);
        runner.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(*journal.lock().unwrap(), vec!["init", "up", "tear-down"]);
    }

    #[test]
    fn test_generated_ids_are_lowercase() {
        let id = generate_test_id();
        assert_eq!(id.len(), TEST_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
