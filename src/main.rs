//! ekstest - end-to-end harness for managed Kubernetes clusters

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use ekstest_cloud::{AwsCli, CloudClients};
use ekstest_common::exec::{CommandRunner, ProcessRunner};
use ekstest_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use ekstest_common::CancellationToken;
use ekstest_config::env::update_from_environment;
use ekstest_config::store::{create_config, load};
use ekstest_config::{NameSeed, Store};
use ekstest_kube::provisioner::{BinarySpec, Provisioner, AUTHENTICATOR, KUBECTL};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use ekstest::suite::{SuiteRunner, TestConfig};
use ekstest::Tester;

/// ekstest - bring up, probe and tear down managed Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "ekstest", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Managed cluster lifecycle driven by a config document
    Eks {
        #[command(subcommand)]
        command: EksCommand,
    },

    /// Test suites against a kops or eksctl cluster
    Suite {
        #[command(subcommand)]
        command: SuiteCommand,
    },
}

/// Location of the config document
#[derive(Args, Debug)]
struct ConfigArgs {
    /// Config document; rewritten as the run progresses
    #[arg(short = 'c', long = "config", env = "EKSTEST_CONFIG")]
    path: PathBuf,
}

#[derive(Subcommand, Debug)]
enum EksCommand {
    /// Write a default config document with generated names
    CreateConfig(ConfigArgs),

    /// Create the cluster and, when enabled, the load-balancer add-on
    Up(ConfigArgs),

    /// Delete everything the config document records as created
    Down(ConfigArgs),

    /// Run the correctness, throughput and metrics probes
    Test(ConfigArgs),

    /// Up, every enabled probe, then down when the config asks for it
    Run(ConfigArgs),

    /// Collect worker logs and copy them with the config into a directory
    DumpLogs {
        #[command(flatten)]
        config: ConfigArgs,

        /// Destination directory
        #[arg(long)]
        dir: PathBuf,
    },

    /// Fail unless the control plane is active
    Check(ConfigArgs),
}

#[derive(Subcommand, Debug)]
enum SuiteCommand {
    /// Run a test.yaml suite
    Run {
        /// Suite document
        #[arg(long)]
        config: PathBuf,

        /// Downloads, keys and the credential file
        #[arg(long, default_value = ".ekstest")]
        workdir: PathBuf,
    },
}

fn telemetry(format: LogFormat, debug: bool) -> anyhow::Result<()> {
    init_telemetry(&TelemetryConfig { format, debug })
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}

/// Trip `cancel` on SIGINT or SIGTERM
fn cancel_on_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = term.recv() => info!("received SIGTERM"),
        }
        cancel.cancel();
    });
}

async fn tester(path: &Path) -> anyhow::Result<Tester> {
    let mut raw = load(path)?;
    update_from_environment(&mut raw)?;
    telemetry(raw.log_format, raw.log_debug)?;

    let store = Store::open(path, &NameSeed::local())?;
    let cfg = store.config();
    let toolchain = Provisioner::new()?
        .provision(&[
            BinarySpec {
                name: KUBECTL.to_string(),
                path: cfg.kubectl_path.clone(),
                download_url: cfg.kubectl_download_url.clone(),
                sha256: cfg.kubectl_download_sha256.clone(),
            },
            BinarySpec {
                name: AUTHENTICATOR.to_string(),
                path: cfg.aws_iam_authenticator_path.clone(),
                download_url: cfg.aws_iam_authenticator_download_url.clone(),
                sha256: cfg.aws_iam_authenticator_download_sha256.clone(),
            },
        ])
        .await?;

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let cloud = CloudClients::from_backend(Arc::new(AwsCli::new(runner.clone(), cfg.region.clone())));
    let tester = Tester::new(Arc::new(store), cloud, runner, &toolchain).await?;
    cancel_on_signal(tester.cancellation());
    Ok(tester)
}

async fn run_tests(tester: &Tester) -> anyhow::Result<()> {
    let mut failed = Vec::new();
    if let Err(e) = tester.test_correctness().await {
        error!(error = %e, "correctness probe failed");
        failed.push("correctness");
    }
    if let Err(e) = tester.test_throughput().await {
        error!(error = %e, "throughput probe failed");
        failed.push("throughput");
    }
    if let Err(e) = tester.test_metrics().await {
        error!(error = %e, "metrics probe failed");
        failed.push("metrics");
    }
    if !failed.is_empty() {
        anyhow::bail!("probes failed: {}", failed.join(", "));
    }
    Ok(())
}

async fn eks(command: EksCommand) -> anyhow::Result<()> {
    match command {
        EksCommand::CreateConfig(args) => {
            telemetry(LogFormat::Text, false)?;
            let cfg = create_config(&args.path, &NameSeed::local())?;
            println!("wrote {} for cluster {}", args.path.display(), cfg.cluster_name);
        }
        EksCommand::Up(args) => {
            let tester = tester(&args.path).await?;
            tester.up().await?;
            println!("cluster {} is up", tester.config().cluster_name);
        }
        EksCommand::Down(args) => {
            let tester = tester(&args.path).await?;
            tester.down().await?;
            println!("cluster {} is down", tester.config().cluster_name);
        }
        EksCommand::Test(args) => {
            let tester = tester(&args.path).await?;
            run_tests(&tester).await?;
            println!("every probe passed");
        }
        EksCommand::Run(args) => {
            tester(&args.path).await?.run().await?;
        }
        EksCommand::DumpLogs { config, dir } => {
            let tester = tester(&config.path).await?;
            let copied = tester.dump_cluster_logs(&dir).await?;
            println!("copied {} files into {}", copied.len(), dir.display());
        }
        EksCommand::Check(args) => {
            let tester = tester(&args.path).await?;
            tester.is_up().await?;
            println!("cluster {} is active", tester.config().cluster_name);
        }
    }
    Ok(())
}

async fn suite(command: SuiteCommand) -> anyhow::Result<()> {
    match command {
        SuiteCommand::Run { config, workdir } => {
            telemetry(LogFormat::Text, false)?;
            let cfg = TestConfig::load(&config)?;
            let runner = SuiteRunner::new(cfg, Arc::new(ProcessRunner), &workdir)?;
            let cancel = CancellationToken::new();
            cancel_on_signal(cancel.clone());
            info!(test_id = %runner.test_id(), "starting suite");
            runner.run(&cancel).await?;
            println!("suite {} passed", runner.test_id());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Eks { command } => eks(command).await,
        Commands::Suite { command } => suite(command).await,
    };
    if let Err(e) = result {
        error!(error = %e, "ekstest failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
