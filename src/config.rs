//! CLI configuration and argument parsing.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use secrecy::SecretString;

use crate::error::{KruError, Result};
use crate::model::{ClusterModel, WindowsImage, normalize_location};
use crate::upgrade::node::AZURE_STACK_CORDON_DRAIN_TIMEOUT;
use crate::upgrade::{DrainTimeoutPolicy, PoolSelection, RunConfig, Timeouts};
use crate::version::{KNOWN_VERSIONS, available_upgrades};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Tag written to every VM this build creates.
pub const BUILD_TAG: &str = const_format::formatcp!("{}+{}", VERSION, COMMIT);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Rolling VM upgrade for self-managed Kubernetes clusters.
///
/// Replaces control plane nodes one at a time, then worker pools in declared
/// order, and writes the new version back to the api model.
#[derive(Parser, Debug, Clone)]
#[command(name = "kru")]
#[command(about = "Rolling VM upgrade orchestrator for self-managed Kubernetes clusters")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// Resource group the cluster is deployed in
    #[arg(short = 'g', long)]
    pub resource_group: String,

    /// Location the cluster is deployed in
    #[arg(short, long)]
    pub location: String,

    /// Path to the cluster's api model (apimodel.json)
    #[arg(short = 'm', long)]
    pub api_model: PathBuf,

    /// Orchestrator version to upgrade to (e.g., 1.24.0)
    #[arg(short = 'k', long)]
    pub upgrade_version: String,

    /// Kubeconfig for the cluster. Inferred from the environment when absent
    #[arg(short = 'b', long)]
    pub kubeconfig: Option<PathBuf>,

    /// Bound in minutes for deleting, recreating and validating a node
    #[arg(long)]
    pub vm_timeout: Option<u64>,

    /// Bound in minutes for cordoning and draining a node
    #[arg(long)]
    pub cordon_drain_timeout: Option<u64>,

    /// Skip the supported upgrade path check (allows same version and downgrades)
    #[arg(short, long, default_value = "false")]
    pub force: bool,

    /// Upgrade the control plane only
    #[arg(long, default_value = "false", conflicts_with = "pools")]
    pub control_plane_only: bool,

    /// Worker pool to upgrade (repeatable). All pools when omitted
    #[arg(long = "pool", value_name = "POOL")]
    pub pools: Vec<String>,

    /// What to do when a drain times out. Defaults to proceed with --force, fail otherwise
    #[arg(long, value_enum)]
    pub drain_timeout_policy: Option<DrainTimeoutPolicy>,

    /// Worker nodes of one pool that may be upgraded at the same time
    #[arg(long, default_value = "1")]
    pub max_unavailable: usize,

    /// Windows image version for Windows pools
    #[arg(long)]
    pub windows_image_version: Option<String>,

    /// Rebuild Windows nodes from the windowsProfile image. With false they keep their current image
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub upgrade_windows_vhd: bool,

    /// Version the current version may upgrade to (repeatable). Replaces the built-in catalog
    #[arg(long = "supported-version", value_name = "VERSION")]
    pub supported_versions: Vec<String>,

    /// Azure subscription to operate in
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID")]
    pub subscription: Option<String>,

    /// Show the upgrade plan without changing anything
    #[arg(long, default_value = "false")]
    pub dry_run: bool,

    /// Slack Incoming Webhook for start/completion/failure notifications
    #[arg(long, env = "SLACK_WEBHOOK_URL", hide_env_values = true)]
    pub slack_webhook_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "KRU_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "KRU_LOG_FORMAT")]
    pub log_format: LogFormat,
}

/// Application configuration derived from CLI args.
#[derive(Debug, Clone)]
pub struct Config {
    pub resource_group: String,
    pub location: String,
    pub api_model: PathBuf,
    pub target_version: String,
    pub kubeconfig: Option<PathBuf>,
    pub vm_timeout: Option<Duration>,
    pub cordon_drain_timeout: Option<Duration>,
    pub force: bool,
    pub selection: PoolSelection,
    pub drain_timeout_policy: DrainTimeoutPolicy,
    pub max_unavailable: usize,
    pub windows_image: WindowsImage,
    pub supported_versions: Vec<String>,
    pub subscription: Option<String>,
    pub dry_run: bool,
    pub slack_webhook_url: Option<SecretString>,
    pub log_level: String,
    pub log_format: LogFormat,
}

fn minutes(flag: &str, value: Option<u64>) -> Result<Option<Duration>> {
    match value {
        Some(0) => Err(KruError::Configuration(format!(
            "--{flag} must be greater than zero"
        ))),
        Some(m) => m
            .checked_mul(60)
            .map(|secs| Some(Duration::from_secs(secs)))
            .ok_or_else(|| KruError::Configuration(format!("--{flag} {m} is too large"))),
        None => Ok(None),
    }
}

impl Config {
    /// Create config from CLI arguments.
    pub fn from_args(args: Args) -> Result<Self> {
        if args.max_unavailable == 0 {
            return Err(KruError::Configuration(
                "--max-unavailable must be at least 1".to_string(),
            ));
        }
        if args.resource_group.trim().is_empty() {
            return Err(KruError::Configuration(
                "--resource-group must not be empty".to_string(),
            ));
        }

        let windows_image = match (args.upgrade_windows_vhd, args.windows_image_version) {
            (true, version) => WindowsImage::Upgrade { version },
            (false, None) => WindowsImage::Keep,
            (false, Some(_)) => {
                return Err(KruError::Configuration(
                    "--windows-image-version cannot be used with --upgrade-windows-vhd=false"
                        .to_string(),
                ));
            }
        };

        let selection = if args.control_plane_only {
            PoolSelection::control_plane_only()
        } else if args.pools.is_empty() {
            PoolSelection::default()
        } else {
            PoolSelection {
                control_plane_only: false,
                pools: Some(args.pools.into_iter().collect::<BTreeSet<_>>()),
            }
        };

        Ok(Self {
            resource_group: args.resource_group,
            location: normalize_location(&args.location),
            api_model: args.api_model,
            target_version: args.upgrade_version,
            kubeconfig: args.kubeconfig,
            vm_timeout: minutes("vm-timeout", args.vm_timeout)?,
            cordon_drain_timeout: minutes("cordon-drain-timeout", args.cordon_drain_timeout)?,
            force: args.force,
            selection,
            drain_timeout_policy: args
                .drain_timeout_policy
                .unwrap_or_else(|| DrainTimeoutPolicy::default_for(args.force)),
            max_unavailable: args.max_unavailable,
            windows_image,
            supported_versions: args.supported_versions,
            subscription: args.subscription,
            dry_run: args.dry_run,
            slack_webhook_url: args
                .slack_webhook_url
                .filter(|u| !u.is_empty())
                .map(SecretString::from),
            log_level: args.log_level,
            log_format: args.log_format,
        })
    }

    /// Timeouts for this cluster. Azure Stack gets a longer cordon/drain default.
    pub fn timeouts(&self, model: &ClusterModel) -> Timeouts {
        let defaults = Timeouts::default();
        let cordon_drain_default = if model.is_azure_stack() {
            AZURE_STACK_CORDON_DRAIN_TIMEOUT
        } else {
            defaults.cordon_drain
        };

        Timeouts {
            step: self.vm_timeout.unwrap_or(defaults.step),
            cordon_drain: self.cordon_drain_timeout.unwrap_or(cordon_drain_default),
        }
    }

    /// Versions the model's current version may move to without `--force`.
    pub fn supported_upgrades(&self, model: &ClusterModel) -> Vec<String> {
        if self.supported_versions.is_empty() {
            available_upgrades(model.orchestrator_version(), KNOWN_VERSIONS)
        } else {
            self.supported_versions.clone()
        }
    }

    pub fn run_config(&self, model: &ClusterModel) -> RunConfig {
        RunConfig {
            resource_group: self.resource_group.clone(),
            location: self.location.clone(),
            target_version: self.target_version.clone(),
            supported_upgrades: self.supported_upgrades(model),
            force: self.force,
            selection: self.selection.clone(),
            timeouts: self.timeouts(model),
            drain_timeout_policy: self.drain_timeout_policy,
            max_unavailable: self.max_unavailable,
            windows_image: self.windows_image.clone(),
            build_tag: BUILD_TAG.to_string(),
            dry_run: self.dry_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec![
            "kru",
            "-g",
            "rg",
            "-l",
            "westus2",
            "-m",
            "apimodel.json",
            "-k",
            "1.24.0",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    fn model(azure_stack: bool) -> ClusterModel {
        let custom = if azure_stack {
            r#", "customCloudProfile": {"environment": {"name": "AzureStackCloud"}}"#
        } else {
            ""
        };
        serde_json::from_str(&format!(
            r#"{{
                "location": "westus2",
                "properties": {{
                    "orchestratorProfile": {{"orchestratorVersion": "1.23.5"}},
                    "masterProfile": {{"count": 1, "dnsPrefix": "demo"}}
                    {custom}
                }}
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_args(parse(&[])).unwrap();
        assert!(!config.force);
        assert!(!config.dry_run);
        assert_eq!(config.max_unavailable, 1);
        assert_eq!(config.drain_timeout_policy, DrainTimeoutPolicy::Fail);
        assert_eq!(config.selection, PoolSelection::default());
        assert_eq!(config.log_format, LogFormat::Text);

        let timeouts = config.timeouts(&model(false));
        assert_eq!(timeouts, Timeouts::default());
    }

    #[test]
    fn test_force_defaults_drain_policy_to_proceed() {
        let config = Config::from_args(parse(&["--force"])).unwrap();
        assert_eq!(config.drain_timeout_policy, DrainTimeoutPolicy::Proceed);

        let config =
            Config::from_args(parse(&["--force", "--drain-timeout-policy", "fail"])).unwrap();
        assert_eq!(config.drain_timeout_policy, DrainTimeoutPolicy::Fail);
    }

    #[test]
    fn test_azure_stack_cordon_drain_default() {
        let config = Config::from_args(parse(&[])).unwrap();
        let timeouts = config.timeouts(&model(true));
        assert_eq!(timeouts.cordon_drain, Duration::from_secs(3600));
        assert_eq!(timeouts.step, Duration::from_secs(1200));

        let config = Config::from_args(parse(&["--cordon-drain-timeout", "5"])).unwrap();
        assert_eq!(
            config.timeouts(&model(true)).cordon_drain,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = Config::from_args(parse(&["--vm-timeout", "0"])).unwrap_err();
        assert!(matches!(err, KruError::Configuration(_)));
    }

    #[test]
    fn test_oversized_timeout_rejected() {
        let max = u64::MAX.to_string();
        let err = Config::from_args(parse(&["--cordon-drain-timeout", &max])).unwrap_err();
        assert!(matches!(err, KruError::Configuration(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_location_normalized() {
        let argv = [
            "kru", "-g", "rg", "-l", "West US 2", "-m", "m.json", "-k", "1.24.0",
        ];
        let config = Config::from_args(Args::try_parse_from(argv).unwrap()).unwrap();
        assert_eq!(config.location, "westus2");
    }

    #[test]
    fn test_windows_image_flags() {
        let config = Config::from_args(parse(&[])).unwrap();
        assert_eq!(config.windows_image, WindowsImage::Upgrade { version: None });

        let config =
            Config::from_args(parse(&["--windows-image-version", "17763.9999.0"])).unwrap();
        assert_eq!(
            config.windows_image,
            WindowsImage::Upgrade {
                version: Some("17763.9999.0".to_string())
            }
        );

        let config = Config::from_args(parse(&["--upgrade-windows-vhd", "false"])).unwrap();
        assert_eq!(config.windows_image, WindowsImage::Keep);

        let err = Config::from_args(parse(&[
            "--upgrade-windows-vhd=false",
            "--windows-image-version",
            "17763.9999.0",
        ]))
        .unwrap_err();
        assert!(matches!(err, KruError::Configuration(_)));
    }

    #[test]
    fn test_zero_max_unavailable_rejected() {
        assert!(Config::from_args(parse(&["--max-unavailable", "0"])).is_err());
    }

    #[test]
    fn test_pool_selection() {
        let config = Config::from_args(parse(&["--pool", "pool1", "--pool", "pool2"])).unwrap();
        assert_eq!(config.selection, PoolSelection::only(["pool1", "pool2"]));

        let config = Config::from_args(parse(&["--control-plane-only"])).unwrap();
        assert!(config.selection.control_plane_only);
    }

    #[test]
    fn test_control_plane_only_conflicts_with_pool() {
        let argv = [
            "kru",
            "-g",
            "rg",
            "-l",
            "westus2",
            "-m",
            "m.json",
            "-k",
            "1.24.0",
            "--control-plane-only",
            "--pool",
            "pool1",
        ];
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_supported_upgrades_from_catalog_or_flags() {
        let config = Config::from_args(parse(&[])).unwrap();
        let supported = config.supported_upgrades(&model(false));
        assert!(supported.contains(&"1.24.0".to_string()));
        assert!(!supported.contains(&"1.23.5".to_string()));

        let config = Config::from_args(parse(&["--supported-version", "1.25.0"])).unwrap();
        assert_eq!(config.supported_upgrades(&model(false)), vec!["1.25.0"]);
    }

    #[test]
    fn test_run_config() {
        let config = Config::from_args(parse(&["--dry-run", "--max-unavailable", "2"])).unwrap();
        let run = config.run_config(&model(false));
        assert!(run.dry_run);
        assert_eq!(run.max_unavailable, 2);
        assert_eq!(run.target_version, "1.24.0");
        assert_eq!(run.build_tag, BUILD_TAG);
    }
}
