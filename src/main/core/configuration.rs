//! The supervisor's configuration and cli parsing code using [serde] and [clap].
//!
//! The configuration file is YAML (so JSON files are accepted too). General options can also be
//! given on the command line, where they override the configuration file. [schemars] is used to
//! get the option description (its doc comment) and default value so that it can be shown in the
//! CLI help text.
//!
//! Like the rest of the parsing code, this only checks that values are well-formed. Paths aren't
//! checked for existence or canonicalized here.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use merge::Merge;
use once_cell::sync::Lazy;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

const START_HELP_TEXT: &str = "\
    Run programs as sandboxed variants under a ptrace-based monitor.";

const END_HELP_TEXT: &str = "\
    Arguments after '--' are passed to every variant, replacing the 'argv' entries of the \
    configuration file.";

#[derive(Debug, Clone, Parser)]
#[clap(name = "mvee", about = START_HELP_TEXT, after_help = END_HELP_TEXT)]
#[clap(version)]
#[clap(next_display_order = None)]
#[clap(hide_possible_values = true)]
pub struct CliOptions {
    /// Path to the configuration file. Use '-' to read from stdin
    pub config: String,

    /// Exit after printing the final configuration
    #[clap(long)]
    pub show_config: bool,

    /// Comma-delimited list of variants to run, replacing the 'variant_ids' of the configuration
    /// file
    #[clap(long, value_name = "ids", value_delimiter = ',')]
    pub variant_ids: Option<Vec<String>>,

    #[clap(flatten)]
    pub general: GeneralOptions,

    /// Arguments for the variants
    #[clap(last = true, value_name = "args")]
    pub args: Vec<String>,
}

/// Options contained in a configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileOptions {
    #[serde(default)]
    pub general: GeneralOptions,

    pub variant: VariantOptions,

    /// The variants to run. Each id may have its own entry in `variant.specs`.
    #[serde(default = "default_variant_ids")]
    pub variant_ids: Vec<String>,
}

/// Configuration options after processing command-line and configuration file options.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigOptions {
    pub general: GeneralOptions,

    pub variant: VariantOptions,

    pub variant_ids: Vec<String>,

    /// Arguments from the command line that replace the configured arguments.
    pub args: Option<Vec<String>>,
}

impl ConfigOptions {
    pub fn new(mut config_file: ConfigFileOptions, options: CliOptions) -> Self {
        // override config options with command line options
        config_file.general = options
            .general
            .with_defaults(config_file.general)
            .with_defaults(GeneralOptions::default());

        if let Some(ids) = options.variant_ids {
            config_file.variant_ids = ids;
        }

        Self {
            general: config_file.general,
            variant: config_file.variant,
            variant_ids: config_file.variant_ids,
            args: Some(options.args).filter(|x| !x.is_empty()),
        }
    }

    pub fn log_level(&self) -> LogLevel {
        self.general.log_level.unwrap()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.general.poll_interval_ms.unwrap())
    }

    /// The launch options for variant `id`. Options given for this variant in `variant.specs`
    /// replace the corresponding `variant.exec` options.
    pub fn variant_spec(&self, id: &str) -> VariantSpec {
        let spec = self
            .variant
            .specs
            .get(id)
            .cloned()
            .unwrap_or_default()
            .with_defaults(self.variant.exec.clone().into());

        VariantSpec {
            id: id.to_string(),
            path: spec.path.unwrap_or_default(),
            argv: self
                .args
                .clone()
                .or(spec.argv)
                .unwrap_or_default(),
            pwd: spec.pwd,
            env: spec.env.unwrap_or_default(),
        }
    }

    /// The launch options for every configured variant, in order.
    pub fn variant_specs(&self) -> Vec<VariantSpec> {
        self.variant_ids
            .iter()
            .map(|id| self.variant_spec(id))
            .collect()
    }
}

/// Help messages used by Clap for command line arguments, combining the doc string with
/// the Serde default.
static GENERAL_HELP: Lazy<std::collections::HashMap<String, String>> =
    Lazy::new(|| generate_help_strs(schema_for!(GeneralOptions)));

// these must all be Option types since they aren't required by the CLI
#[derive(Debug, Clone, Parser, Serialize, Deserialize, Merge, JsonSchema)]
#[clap(next_help_heading = "General (Override configuration file options)")]
#[clap(next_display_order = None)]
#[serde(deny_unknown_fields)]
pub struct GeneralOptions {
    /// Log level of output written on stdout. If built in release mode, then log messages at
    /// level 'trace' will always be dropped
    #[clap(long, short = 'l', value_name = "level")]
    #[clap(help = GENERAL_HELP.get("log_level").unwrap().as_str())]
    #[serde(default = "default_some_info")]
    pub log_level: Option<LogLevel>,

    /// Directory for the log file
    #[clap(long, value_name = "path")]
    #[clap(help = GENERAL_HELP.get("log_dir").unwrap().as_str())]
    #[serde(default = "default_log_dir")]
    pub log_dir: Option<String>,

    /// Also write log messages to a file in the log directory
    #[clap(long, value_name = "bool")]
    #[clap(help = GENERAL_HELP.get("log_to_file").unwrap().as_str())]
    #[serde(default = "default_some_false")]
    pub log_to_file: Option<bool>,

    /// Duplicate warnings and errors on stderr
    #[clap(long, value_name = "bool")]
    #[clap(help = GENERAL_HELP.get("warnings_to_stderr").unwrap().as_str())]
    #[serde(default = "default_some_true")]
    pub warnings_to_stderr: Option<bool>,

    /// How long a monitor waits for a variant event before checking for shutdown and handoffs
    #[clap(long, value_name = "ms")]
    #[clap(help = GENERAL_HELP.get("poll_interval_ms").unwrap().as_str())]
    #[serde(default = "default_some_10")]
    pub poll_interval_ms: Option<u64>,

    /// Run each variant binary from a private copy in the 'special' directory
    #[clap(long, value_name = "bool")]
    #[clap(help = GENERAL_HELP.get("use_special_files").unwrap().as_str())]
    #[serde(default = "default_some_false")]
    pub use_special_files: Option<bool>,
}

impl GeneralOptions {
    /// Replace unset fields with fields from `default`.
    pub fn with_defaults(mut self, default: Self) -> Self {
        self.merge(default);
        self
    }
}

impl Default for GeneralOptions {
    fn default() -> Self {
        Self {
            log_level: default_some_info(),
            log_dir: default_log_dir(),
            log_to_file: default_some_false(),
            warnings_to_stderr: default_some_true(),
            poll_interval_ms: default_some_10(),
            use_special_files: default_some_false(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariantOptions {
    /// Launch options shared by all variants.
    pub exec: ExecOptions,

    /// Per-variant launch options, by variant id.
    #[serde(default)]
    pub specs: BTreeMap<String, VariantSpecOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecOptions {
    pub path: String,

    /// Arguments, not including argv[0].
    #[serde(default)]
    pub argv: Vec<String>,

    /// Environment changes as 'KEY=VALUE' strings.
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Merge)]
#[serde(deny_unknown_fields)]
pub struct VariantSpecOptions {
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub argv: Option<Vec<String>>,

    /// Working directory of the variant.
    #[serde(default)]
    pub pwd: Option<String>,

    #[serde(default)]
    pub env: Option<Vec<String>>,
}

impl VariantSpecOptions {
    pub fn with_defaults(mut self, default: Self) -> Self {
        self.merge(default);
        self
    }
}

impl From<ExecOptions> for VariantSpecOptions {
    fn from(exec: ExecOptions) -> Self {
        Self {
            path: Some(exec.path),
            argv: Some(exec.argv),
            pwd: None,
            env: Some(exec.env),
        }
    }
}

/// The resolved launch options of a single variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantSpec {
    pub id: String,
    pub path: String,
    pub argv: Vec<String>,
    pub pwd: Option<String>,
    pub env: Vec<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = serde_yaml::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s)
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

fn default_variant_ids() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_log_dir() -> Option<String> {
    Some("Logs".into())
}

/// Helper function for serde default `Some(true)` values.
fn default_some_true() -> Option<bool> {
    Some(true)
}

/// Helper function for serde default `Some(false)` values.
fn default_some_false() -> Option<bool> {
    Some(false)
}

fn default_some_10() -> Option<u64> {
    Some(10)
}

/// Helper function for serde default `Some(LogLevel::Info)` values.
fn default_some_info() -> Option<LogLevel> {
    Some(LogLevel::Info)
}

/// Generate help strings for objects in a JSON schema, including the Serde defaults if available.
fn generate_help_strs(
    schema: schemars::schema::RootSchema,
) -> std::collections::HashMap<String, String> {
    let mut defaults = std::collections::HashMap::<String, String>::new();
    for (name, obj) in &schema.schema.object.as_ref().unwrap().properties {
        if let Some(meta) = obj.clone().into_object().metadata {
            let description = meta.description.unwrap_or_default();
            let space = if !description.is_empty() { " " } else { "" };
            match meta.default {
                Some(default) => defaults.insert(
                    name.clone(),
                    format!("{}{}[default: {}]", description, space, default),
                ),
                None => defaults.insert(name.clone(), description.to_string()),
            };
        }
    }
    defaults
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        general:
          log_level: debug
          poll_interval_ms: 5
        variant:
          exec:
            path: /bin/true
            argv: ["--flag"]
            env: ["LD_LIBRARY_PATH=/opt/lib"]
          specs:
            fast:
              path: /usr/bin/true
              pwd: /tmp
            slow:
              argv: ["--slow"]
              env: []
        variant_ids: [fast, slow, other]
        "#;

    fn parse(yaml: &str, cli: &[&str]) -> ConfigOptions {
        let config_file: ConfigFileOptions = serde_yaml::from_str(yaml).unwrap();
        let cli = CliOptions::try_parse_from(cli).unwrap();
        ConfigOptions::new(config_file, cli)
    }

    #[test]
    fn test_file_options() {
        let config = parse(CONFIG, &["mvee", "config.yaml"]);

        assert_eq!(config.log_level(), LogLevel::Debug);
        assert_eq!(config.poll_interval(), Duration::from_millis(5));
        // defaults
        assert_eq!(config.general.log_dir.as_deref(), Some("Logs"));
        assert_eq!(config.general.log_to_file, Some(false));
        assert_eq!(config.general.warnings_to_stderr, Some(true));
        assert_eq!(config.variant_ids, ["fast", "slow", "other"]);
    }

    #[test]
    fn test_cli_overrides_file() {
        let config = parse(
            CONFIG,
            &[
                "mvee",
                "--log-level",
                "trace",
                "--log-to-file",
                "true",
                "--variant-ids",
                "fast,other",
                "config.yaml",
            ],
        );

        assert_eq!(config.log_level(), LogLevel::Trace);
        assert_eq!(config.general.log_to_file, Some(true));
        // not given on the command line
        assert_eq!(config.poll_interval(), Duration::from_millis(5));
        assert_eq!(config.variant_ids, ["fast", "other"]);
    }

    #[test]
    fn test_variant_precedence() {
        let config = parse(CONFIG, &["mvee", "config.yaml"]);
        let specs = config.variant_specs();

        assert_eq!(
            specs[0],
            VariantSpec {
                id: "fast".into(),
                path: "/usr/bin/true".into(),
                argv: vec!["--flag".into()],
                pwd: Some("/tmp".into()),
                env: vec!["LD_LIBRARY_PATH=/opt/lib".into()],
            }
        );
        assert_eq!(
            specs[1],
            VariantSpec {
                id: "slow".into(),
                path: "/bin/true".into(),
                argv: vec!["--slow".into()],
                pwd: None,
                env: vec![],
            }
        );
        // no per-variant entry
        assert_eq!(specs[2].path, "/bin/true");
        assert_eq!(specs[2].argv, ["--flag"]);
    }

    #[test]
    fn test_cli_args_replace_argv() {
        let config = parse(CONFIG, &["mvee", "config.yaml", "--", "a", "--b"]);
        for spec in config.variant_specs() {
            assert_eq!(spec.argv, ["a", "--b"]);
        }
    }

    #[test]
    fn test_minimal_json() {
        let config = parse(
            r#"{"variant": {"exec": {"path": "/bin/ls"}}}"#,
            &["mvee", "-"],
        );
        assert_eq!(config.log_level(), LogLevel::Info);
        assert_eq!(
            config.variant_specs(),
            vec![VariantSpec {
                id: "default".into(),
                path: "/bin/ls".into(),
                argv: vec![],
                pwd: None,
                env: vec![],
            }]
        );
    }

    #[test]
    fn test_unknown_fields() {
        let yaml = "variant:\n  exec:\n    path: /bin/ls\n    pwd: /tmp\n";
        assert!(serde_yaml::from_str::<ConfigFileOptions>(yaml).is_err());

        let yaml = "general:\n  color: true\nvariant:\n  exec:\n    path: /bin/ls\n";
        assert!(serde_yaml::from_str::<ConfigFileOptions>(yaml).is_err());
    }

    #[test]
    fn test_log_level() {
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warning);
        assert!(LogLevel::from_str("loud").is_err());
        assert_eq!(log::Level::from(LogLevel::Warning), log::Level::Warn);
    }

    #[test]
    fn test_help_strs() {
        let help = generate_help_strs(schema_for!(GeneralOptions));
        assert!(help["poll_interval_ms"].ends_with("[default: 10]"));
    }
}
