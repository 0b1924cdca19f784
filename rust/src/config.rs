use clap::{Arg, ArgAction, ArgMatches, Command, ValueEnum};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_RUNTIME_SECS: u64 = 24 * 60 * 60;
const DEFAULT_KILL_GRACE_MS: u64 = 2000;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    None,
}

/// What happens to a child whose caller went away mid-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPolicy {
    Terminate,
    Detach,
}

impl DisconnectPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminate => "terminate",
            Self::Detach => "detach",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsConfig {
    Disabled,
    AllowAll,
    AllowList { raw: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSettings {
    pub panel_data: String,
    pub bamcheck: String,
    pub coverage_matrix: String,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            panel_data: "/data/highlander/retreive_panel_data.sh".to_string(),
            bamcheck: "/data/highlander/do_bamcheck.sh".to_string(),
            coverage_matrix: "/data/highlander/do_coverageMatrix.sh".to_string(),
        }
    }
}

/// Fixed `sbatch` parameters for batch submissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub program: String,
    pub partition: String,
    pub chdir: PathBuf,
    pub mail_user: Option<String>,
    pub mail_type: String,
    pub ntasks: u32,
    pub cpus_per_task: u32,
    pub mem: String,
    pub time: String,
    pub log_dir: PathBuf,
    pub job_prefix: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            program: "sbatch".to_string(),
            partition: "computeGPU".to_string(),
            chdir: PathBuf::from("/tmp"),
            mail_user: None,
            mail_type: "FAIL,REQUEUE".to_string(),
            ntasks: 1,
            cpus_per_task: 4,
            mem: "14g".to_string(),
            time: "500:00:00".to_string(),
            log_dir: PathBuf::from("/data/highlander/php/logs"),
            job_prefix: "CovMat".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub host: String,
    pub port: u16,
    pub log_level: LogLevel,
    pub cors: CorsConfig,
    pub health_endpoints: Vec<String>,
    pub auth_token: Option<String>,
    pub child_env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub max_runtime: Duration,
    pub kill_grace: Duration,
    pub disconnect_policy: DisconnectPolicy,
    pub max_upload_bytes: usize,
    pub staging_dir: PathBuf,
    pub scripts: ScriptSettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone)]
pub struct InvokeConfig {
    pub url: String,
    pub fields: Vec<(String, String)>,
    pub files: Vec<(String, PathBuf)>,
    pub token: Option<String>,
    pub quiet: bool,
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogsLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogsTailConfig {
    pub file: Option<PathBuf>,
    pub follow: bool,
    pub lines: usize,
    pub level: Option<LogsLevel>,
    pub endpoint: Option<String>,
    pub json: bool,
}

#[derive(Debug, Clone)]
pub enum LogsConfig {
    Tail(LogsTailConfig),
}

#[derive(Debug, Clone)]
pub enum CliCommand {
    Serve(Box<ServeConfig>),
    Invoke(InvokeConfig),
    Logs(LogsConfig),
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidFile(String),
    InvalidPort(String),
    InvalidArg(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidFile(msg) => write!(f, "{msg}"),
            ConfigError::InvalidPort(msg) => write!(f, "{msg}"),
            ConfigError::InvalidArg(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    server: FileServer,
    scripts: FileScripts,
    staging: FileStaging,
    scheduler: FileScheduler,
    env: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileServer {
    host: Option<String>,
    port: Option<u16>,
    health_endpoints: Option<Vec<String>>,
    auth_token: Option<String>,
    working_dir: Option<PathBuf>,
    max_runtime_secs: Option<u64>,
    kill_grace_ms: Option<u64>,
    disconnect_policy: Option<DisconnectPolicy>,
    max_upload_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileScripts {
    panel_data: Option<String>,
    bamcheck: Option<String>,
    coverage_matrix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileStaging {
    dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileScheduler {
    program: Option<String>,
    partition: Option<String>,
    chdir: Option<PathBuf>,
    mail_user: Option<String>,
    mail_type: Option<String>,
    ntasks: Option<u32>,
    cpus_per_task: Option<u32>,
    mem: Option<String>,
    time: Option<String>,
    log_dir: Option<PathBuf>,
    job_prefix: Option<String>,
}

pub fn parse_cli_command() -> Result<CliCommand, ConfigError> {
    let raw_args: Vec<String> = env::args().collect();
    parse_cli_command_from(raw_args)
}

fn parse_cli_command_from(mut raw_args: Vec<String>) -> Result<CliCommand, ConfigError> {
    match raw_args.get(1).map(String::as_str) {
        Some("invoke") => parse_invoke_config_from(raw_args).map(CliCommand::Invoke),
        Some("logs") => parse_logs_config_from(raw_args).map(CliCommand::Logs),
        Some("serve") => {
            raw_args.remove(1);
            parse_serve_config_from(raw_args).map(|cfg| CliCommand::Serve(Box::new(cfg)))
        }
        _ => parse_serve_config_from(raw_args).map(|cfg| CliCommand::Serve(Box::new(cfg))),
    }
}

fn parse_serve_config_from(raw_args: Vec<String>) -> Result<ServeConfig, ConfigError> {
    let cors_input = parse_cors_flags(&raw_args);
    let matches = build_cli()
        .try_get_matches_from(raw_args)
        .map_err(|err| ConfigError::InvalidArg(err.to_string()))?;

    let file = match matches.get_one::<String>("config") {
        Some(path) => load_file_config(Path::new(path))?,
        None => FileConfig::default(),
    };

    let host = matches
        .get_one::<String>("host")
        .cloned()
        .or(file.server.host)
        .unwrap_or_else(|| "127.0.0.1".to_string());

    let port = match matches
        .get_one::<String>("port")
        .cloned()
        .or_else(|| env::var("PORT").ok())
    {
        Some(raw) => parse_port(&raw)?,
        None => file.server.port.unwrap_or(DEFAULT_PORT),
    };

    let log_level = matches
        .get_one::<LogLevel>("logLevel")
        .copied()
        .unwrap_or(LogLevel::Info);

    let mut health_endpoints: Vec<String> = matches
        .get_many::<String>("healthEndpoint")
        .map(|vals| {
            vals.filter(|v| !v.is_empty())
                .map(|v| v.to_string())
                .collect()
        })
        .unwrap_or_default();
    if health_endpoints.is_empty() {
        health_endpoints = file.server.health_endpoints.unwrap_or_default();
    }
    for path in &health_endpoints {
        if !path.starts_with('/') {
            return Err(ConfigError::InvalidArg(format!(
                "healthEndpoint must start with '/', received: {path}"
            )));
        }
    }

    let cors = if cors_input.present {
        if cors_input.allow_all || cors_input.values.is_empty() {
            CorsConfig::AllowAll
        } else {
            CorsConfig::AllowList {
                raw: cors_input.values,
            }
        }
    } else {
        CorsConfig::Disabled
    };

    let auth_token = matches
        .get_one::<String>("authToken")
        .cloned()
        .or(file.server.auth_token)
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());

    let env_values: Vec<String> = matches
        .get_many::<String>("env")
        .map(|vals| vals.map(|v| v.to_string()).collect())
        .unwrap_or_default();
    let mut child_env = BTreeMap::new();
    if let Some(path) = env::var_os("PATH") {
        child_env.insert("PATH".to_string(), path.to_string_lossy().into_owned());
    }
    child_env.extend(file.env);
    child_env.extend(parse_env_values(&env_values));

    let working_dir = matches
        .get_one::<String>("workingDir")
        .map(PathBuf::from)
        .or(file.server.working_dir);

    let max_runtime_secs = match matches.get_one::<String>("maxRuntimeSecs") {
        Some(raw) => parse_positive("maxRuntimeSecs", raw)?,
        None => file
            .server
            .max_runtime_secs
            .unwrap_or(DEFAULT_MAX_RUNTIME_SECS),
    };
    if max_runtime_secs == 0 {
        return Err(ConfigError::InvalidArg(
            "maxRuntimeSecs must be a positive number".to_string(),
        ));
    }
    let kill_grace_ms = match matches.get_one::<String>("killGraceMs") {
        Some(raw) => parse_positive("killGraceMs", raw)?,
        None => file.server.kill_grace_ms.unwrap_or(DEFAULT_KILL_GRACE_MS),
    };

    let disconnect_policy = matches
        .get_one::<DisconnectPolicy>("disconnectPolicy")
        .copied()
        .or(file.server.disconnect_policy)
        .unwrap_or(DisconnectPolicy::Terminate);

    let max_upload_bytes = match matches.get_one::<String>("maxUploadBytes") {
        Some(raw) => parse_positive("maxUploadBytes", raw)? as usize,
        None => file
            .server
            .max_upload_bytes
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
    };

    let staging_dir = matches
        .get_one::<String>("stagingDir")
        .map(PathBuf::from)
        .or(file.staging.dir)
        .unwrap_or_else(|| PathBuf::from("/data/highlander/bam/bamout"));

    let defaults = ScriptSettings::default();
    let scripts = ScriptSettings {
        panel_data: matches
            .get_one::<String>("panelDataScript")
            .cloned()
            .or(file.scripts.panel_data)
            .unwrap_or(defaults.panel_data),
        bamcheck: matches
            .get_one::<String>("bamcheckScript")
            .cloned()
            .or(file.scripts.bamcheck)
            .unwrap_or(defaults.bamcheck),
        coverage_matrix: matches
            .get_one::<String>("coverageMatrixScript")
            .cloned()
            .or(file.scripts.coverage_matrix)
            .unwrap_or(defaults.coverage_matrix),
    };

    let scheduler = merge_scheduler(&matches, file.scheduler);

    Ok(ServeConfig {
        host,
        port,
        log_level,
        cors,
        health_endpoints,
        auth_token,
        child_env,
        working_dir,
        max_runtime: Duration::from_secs(max_runtime_secs),
        kill_grace: Duration::from_millis(kill_grace_ms),
        disconnect_policy,
        max_upload_bytes,
        staging_dir,
        scripts,
        scheduler,
    })
}

fn merge_scheduler(matches: &ArgMatches, file: FileScheduler) -> SchedulerSettings {
    let defaults = SchedulerSettings::default();
    SchedulerSettings {
        program: matches
            .get_one::<String>("sbatch")
            .cloned()
            .or(file.program)
            .unwrap_or(defaults.program),
        partition: file.partition.unwrap_or(defaults.partition),
        chdir: file.chdir.unwrap_or(defaults.chdir),
        mail_user: file.mail_user.filter(|user| !user.trim().is_empty()),
        mail_type: file.mail_type.unwrap_or(defaults.mail_type),
        ntasks: file.ntasks.unwrap_or(defaults.ntasks),
        cpus_per_task: file.cpus_per_task.unwrap_or(defaults.cpus_per_task),
        mem: file.mem.unwrap_or(defaults.mem),
        time: file.time.unwrap_or(defaults.time),
        log_dir: matches
            .get_one::<String>("schedulerLogDir")
            .map(PathBuf::from)
            .or(file.log_dir)
            .unwrap_or(defaults.log_dir),
        job_prefix: file.job_prefix.unwrap_or(defaults.job_prefix),
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let body = std::fs::read_to_string(path).map_err(|err| {
        ConfigError::InvalidFile(format!("Failed to read {}: {err}", path.display()))
    })?;
    toml::from_str(&body)
        .map_err(|err| ConfigError::InvalidFile(format!("Invalid TOML in {}: {err}", path.display())))
}

fn parse_invoke_config_from(raw_args: Vec<String>) -> Result<InvokeConfig, ConfigError> {
    let matches = build_invoke_root_cli()
        .try_get_matches_from(raw_args)
        .map_err(|err| ConfigError::InvalidArg(err.to_string()))?;
    let Some(sub) = matches.subcommand_matches("invoke") else {
        return Err(ConfigError::InvalidArg(
            "Failed to parse invoke subcommand".to_string(),
        ));
    };

    let url = required_arg(sub, "url")?.to_string();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::InvalidArg(format!(
            "invoke URL must be http:// or https://, received: {url}"
        )));
    }

    let fields = sub
        .get_many::<String>("field")
        .map(|vals| {
            vals.map(|raw| split_pair(raw, "--field"))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();
    let files = sub
        .get_many::<String>("file")
        .map(|vals| {
            vals.map(|raw| split_pair(raw, "--file").map(|(k, v)| (k, PathBuf::from(v))))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(InvokeConfig {
        url,
        fields,
        files,
        token: sub.get_one::<String>("token").cloned(),
        quiet: sub.get_flag("quiet"),
        log_level: sub
            .get_one::<LogLevel>("logLevel")
            .copied()
            .unwrap_or(LogLevel::None),
    })
}

fn parse_logs_config_from(raw_args: Vec<String>) -> Result<LogsConfig, ConfigError> {
    let matches = build_logs_root_cli()
        .try_get_matches_from(raw_args)
        .map_err(|err| ConfigError::InvalidArg(err.to_string()))?;
    let Some(logs) = matches.subcommand_matches("logs") else {
        return Err(ConfigError::InvalidArg(
            "Failed to parse logs subcommand".to_string(),
        ));
    };
    let Some(tail) = logs.subcommand_matches("tail") else {
        return Err(ConfigError::InvalidArg(
            "logs requires the tail subcommand".to_string(),
        ));
    };

    let lines = tail
        .get_one::<String>("lines")
        .map(|raw| {
            raw.parse::<usize>().map_err(|_| {
                ConfigError::InvalidArg(format!("--lines must be a number, received: {raw}"))
            })
        })
        .transpose()?
        .unwrap_or(50);

    Ok(LogsConfig::Tail(LogsTailConfig {
        file: tail.get_one::<String>("file").map(PathBuf::from),
        follow: tail.get_flag("follow"),
        lines,
        level: tail.get_one::<LogsLevel>("level").copied(),
        endpoint: tail.get_one::<String>("endpoint").cloned(),
        json: tail.get_flag("json"),
    }))
}

fn build_cli() -> Command {
    Command::new("cmdstream")
        .about("Stream external analysis scripts over HTTP")
        .arg(Arg::new("config").long("config").value_name("FILE"))
        .arg(Arg::new("host").long("host").value_name("ADDR"))
        .arg(Arg::new("port").long("port").value_name("PORT"))
        .arg(
            Arg::new("logLevel")
                .long("logLevel")
                .value_parser(clap::builder::EnumValueParser::<LogLevel>::new())
                .default_value("info"),
        )
        .arg(
            Arg::new("cors")
                .long("cors")
                .num_args(0..=1)
                .action(ArgAction::Append)
                .value_name("ORIGIN"),
        )
        .arg(
            Arg::new("healthEndpoint")
                .long("healthEndpoint")
                .action(ArgAction::Append)
                .value_name("PATH"),
        )
        .arg(Arg::new("authToken").long("authToken").value_name("TOKEN"))
        .arg(
            Arg::new("env")
                .long("env")
                .action(ArgAction::Append)
                .value_name("KEY=VALUE"),
        )
        .arg(Arg::new("workingDir").long("workingDir").value_name("DIR"))
        .arg(
            Arg::new("maxRuntimeSecs")
                .long("maxRuntimeSecs")
                .value_name("SECONDS"),
        )
        .arg(
            Arg::new("killGraceMs")
                .long("killGraceMs")
                .value_name("MILLISECONDS"),
        )
        .arg(
            Arg::new("disconnectPolicy")
                .long("disconnectPolicy")
                .value_parser(clap::builder::EnumValueParser::<DisconnectPolicy>::new())
                .value_name("terminate|detach"),
        )
        .arg(
            Arg::new("maxUploadBytes")
                .long("maxUploadBytes")
                .value_name("BYTES"),
        )
        .arg(Arg::new("stagingDir").long("stagingDir").value_name("DIR"))
        .arg(
            Arg::new("panelDataScript")
                .long("panelDataScript")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("bamcheckScript")
                .long("bamcheckScript")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("coverageMatrixScript")
                .long("coverageMatrixScript")
                .value_name("PATH"),
        )
        .arg(Arg::new("sbatch").long("sbatch").value_name("PATH"))
        .arg(
            Arg::new("schedulerLogDir")
                .long("schedulerLogDir")
                .value_name("DIR"),
        )
}

fn build_invoke_root_cli() -> Command {
    Command::new("cmdstream")
        .subcommand_required(true)
        .subcommand(build_invoke_subcommand())
}

fn build_logs_root_cli() -> Command {
    Command::new("cmdstream")
        .subcommand_required(true)
        .subcommand(build_logs_subcommand())
}

fn build_invoke_subcommand() -> Command {
    Command::new("invoke")
        .about("Post a form to an endpoint and relay the streamed command output")
        .arg(Arg::new("url").required(true).value_name("URL"))
        .arg(
            Arg::new("field")
                .long("field")
                .short('f')
                .action(ArgAction::Append)
                .value_name("NAME=VALUE"),
        )
        .arg(
            Arg::new("file")
                .long("file")
                .action(ArgAction::Append)
                .value_name("NAME=PATH"),
        )
        .arg(Arg::new("token").long("token").value_name("TOKEN"))
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .short('q')
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("logLevel")
                .long("logLevel")
                .value_parser(clap::builder::EnumValueParser::<LogLevel>::new())
                .default_value("none"),
        )
}

fn build_logs_subcommand() -> Command {
    Command::new("logs").subcommand_required(true).subcommand(
        Command::new("tail")
            .about("Print recent structured log records")
            .arg(Arg::new("file").long("file").value_name("PATH"))
            .arg(
                Arg::new("follow")
                    .long("follow")
                    .short('F')
                    .action(ArgAction::SetTrue),
            )
            .arg(Arg::new("lines").long("lines").short('n').value_name("N"))
            .arg(
                Arg::new("level")
                    .long("level")
                    .value_parser(clap::builder::EnumValueParser::<LogsLevel>::new()),
            )
            .arg(Arg::new("endpoint").long("endpoint").value_name("NAME"))
            .arg(Arg::new("json").long("json").action(ArgAction::SetTrue)),
    )
}

fn required_arg<'a>(matches: &'a ArgMatches, key: &str) -> Result<&'a str, ConfigError> {
    matches
        .get_one::<String>(key)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::InvalidArg(format!("Missing required arg {key}")))
}

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    let val: i64 = raw.parse().map_err(|_| {
        ConfigError::InvalidPort(format!("port must be a valid port, received: {raw}"))
    })?;
    if val <= 0 || val > u16::MAX as i64 {
        return Err(ConfigError::InvalidPort(format!(
            "port must be in 1..=65535, received: {raw}"
        )));
    }
    Ok(val as u16)
}

fn parse_positive(name: &str, raw: &str) -> Result<u64, ConfigError> {
    let val: i64 = raw.parse().map_err(|_| {
        ConfigError::InvalidArg(format!("{name} must be a positive number, received: {raw}"))
    })?;
    if val <= 0 {
        return Err(ConfigError::InvalidArg(format!(
            "{name} must be a positive number, received: {raw}"
        )));
    }
    Ok(val as u64)
}

fn split_pair(raw: &str, flag: &str) -> Result<(String, String), ConfigError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(ConfigError::InvalidArg(format!(
            "{flag} expects NAME=VALUE, received: {raw}"
        ))),
    }
}

#[derive(Default)]
struct CorsInput {
    present: bool,
    allow_all: bool,
    values: Vec<String>,
}

fn parse_cors_flags(args: &[String]) -> CorsInput {
    let mut input = CorsInput::default();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--cors" {
            input.present = true;
            match args.get(i + 1) {
                Some(next_val) if !next_val.starts_with("--") => {
                    if next_val == "*" {
                        input.allow_all = true;
                    } else {
                        input.values.push(next_val.clone());
                    }
                    i += 1;
                }
                _ => input.allow_all = true,
            }
        }
        i += 1;
    }
    input
}

fn parse_env_values(values: &[String]) -> BTreeMap<String, String> {
    let mut env_map = BTreeMap::new();
    for raw in values {
        let Some((key, value)) = raw.split_once('=') else {
            tracing::error!("Invalid env format: {raw}, expected KEY=VALUE, ignoring");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            tracing::error!("Invalid env format: {raw}, expected KEY=VALUE, ignoring");
            continue;
        }
        env_map.insert(key.to_string(), value.to_string());
    }
    env_map
}
