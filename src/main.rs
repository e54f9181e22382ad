use clap::{Arg, Command};

use conductor_runtime::{ControlPlane, PolicyDocument, RuntimeConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let matches = Command::new("conductor")
        .version(VERSION)
        .about("Conductor - enterprise multi-agent control plane")
        .subcommand(
            Command::new("serve")
                .about("Start the control plane API")
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .value_name("PORT")
                        .help("Ingress API port (overrides PORT)"),
                )
                .arg(
                    Arg::new("bind")
                        .long("bind")
                        .value_name("ADDRESS")
                        .help("Bind address (overrides BIND_ADDRESS)"),
                ),
        )
        .subcommand(
            Command::new("check-policy")
                .about("Validate a governance policy YAML file")
                .arg(
                    Arg::new("file")
                        .value_name("FILE")
                        .required(true)
                        .help("Path to the policy YAML"),
                ),
        )
        .subcommand_required(true)
        .get_matches();

    match matches.subcommand() {
        Some(("serve", serve_args)) => {
            init_tracing();

            let mut config = RuntimeConfig::from_env()?;
            if let Some(port) = serve_args.get_one::<String>("port") {
                config.api.port = port.parse()?;
            }
            if let Some(bind) = serve_args.get_one::<String>("bind") {
                config.api.bind_address = bind.clone();
            }

            let plane = ControlPlane::new(config).await?;
            spawn_policy_reload_on_hangup(&plane);
            plane.serve().await?;
            Ok(())
        }
        Some(("check-policy", check_args)) => {
            let Some(path) = check_args.get_one::<String>("file") else {
                anyhow::bail!("FILE argument is required");
            };
            match PolicyDocument::from_yaml_file(std::path::Path::new(path)) {
                Ok(document) => {
                    println!(
                        "{path}: ok ({} roles, {} tool restrictions, default {:?})",
                        document.roles.len(),
                        document.tools.restrictions.len(),
                        document.default_decision,
                    );
                    Ok(())
                }
                Err(err) => {
                    eprintln!("{path}: {err}");
                    std::process::exit(1);
                }
            }
        }
        _ => unreachable!("subcommand is required"),
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Reload policies on SIGHUP, the conventional ops signal for config
/// refresh. Reload is atomic; in-flight decisions are unaffected.
#[cfg(unix)]
fn spawn_policy_reload_on_hangup(plane: &ControlPlane) {
    let policy = plane.policy.clone();
    tokio::spawn(async move {
        let Ok(mut hangup) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            tracing::warn!("could not install SIGHUP handler; policy reload via signal disabled");
            return;
        };
        while hangup.recv().await.is_some() {
            match policy.reload().await {
                Ok(source) => tracing::info!(?source, "policies reloaded on SIGHUP"),
                Err(err) => tracing::error!(error = %err, "policy reload failed"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_policy_reload_on_hangup(_plane: &ControlPlane) {}
