mod error;
pub mod process;

pub use error::{EnvError, EnvResult};

use chrono::{DateTime, Utc};
use crawlbed_llm::{GeneratedFileSet, choose_entry_page, normalize_file_path};
use crawlbed_serve::READY_LINE_PREFIX;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const METADATA_FILE: &str = ".crawlbed.json";
pub const SERVER_LOG_FILE: &str = ".crawlbed-server.log";

const STOP_WAIT: Duration = Duration::from_secs(3);
const MAX_NAME_SUFFIX: u32 = 1000;
const MAX_SLUG_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvStatus {
    Running,
    Stopped,
}

impl fmt::Display for EnvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// What the environment was generated from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnvSource {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    pub dir: PathBuf,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub status: EnvStatus,
    pub created_at: DateTime<Utc>,
    pub source: Option<EnvSource>,
    pub files: Vec<String>,
}

impl Environment {
    pub fn is_running(&self) -> bool {
        self.status == EnvStatus::Running
    }

    pub fn url(&self) -> Option<String> {
        match (self.status, self.port) {
            (EnvStatus::Running, Some(port)) => Some(format!("http://localhost:{port}/")),
            _ => None,
        }
    }

    /// The page the site opens on, falling back to `index.html` for an empty listing.
    pub fn entry_page(&self) -> &str {
        choose_entry_page(self.files.iter().map(String::as_str)).unwrap_or("index.html")
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    fn record(&self) -> MetadataRecord {
        MetadataRecord {
            name: self.name.clone(),
            created_at: self.created_at,
            port: self.port,
            pid: self.pid,
            source: self.source.clone(),
            files: self.files.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataRecord {
    name: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    source: Option<EnvSource>,
    #[serde(default)]
    files: Vec<String>,
}

/// Outcome of a collect-and-continue operation over many environments.
#[derive(Debug, Default)]
pub struct BulkReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, EnvError)>,
}

impl BulkReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.failed.iter().map(|(name, _)| name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub root: PathBuf,
    pub base_port: u16,
    pub port_scan_limit: u16,
    pub host: String,
    pub startup_timeout: Duration,
    pub server_program: PathBuf,
    pub server_args: Vec<String>,
}

impl ManagerConfig {
    pub fn new(root: impl Into<PathBuf>, server_program: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            base_port: 8000,
            port_scan_limit: 1000,
            host: "127.0.0.1".to_string(),
            startup_timeout: Duration::from_secs(10),
            server_program: server_program.into(),
            server_args: vec!["serve-dir".to_string()],
        }
    }
}

enum Startup {
    Ready,
    Exited(ExitStatus),
    TimedOut,
}

pub struct EnvironmentManager {
    config: ManagerConfig,
}

impl EnvironmentManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Writes `files` into a freshly claimed directory. Nothing is left behind on failure.
    pub fn create(
        &self,
        name_hint: &str,
        files: &GeneratedFileSet,
        source: Option<EnvSource>,
    ) -> EnvResult<Environment> {
        let root = &self.config.root;
        fs::create_dir_all(root).map_err(EnvError::io(format!(
            "failed creating environments root {}",
            root.display()
        )))?;

        let created_at = Utc::now();
        let base_name = format!("{}-{}", slugify(name_hint), created_at.format("%Y%m%d-%H%M%S"));
        let (name, dir) = self.claim_directory(&base_name)?;
        debug!(env = %name, dir = %dir.display(), "claimed environment directory");

        let mut env = Environment {
            name,
            dir,
            port: None,
            pid: None,
            status: EnvStatus::Stopped,
            created_at,
            source,
            files: Vec::new(),
        };

        if let Err(err) = write_files(&env.dir, files).and_then(|paths| {
            env.files = paths;
            write_metadata(&env)
        }) {
            if let Err(cleanup) = fs::remove_dir_all(&env.dir) {
                warn!(
                    "failed rolling back environment {}: {cleanup}",
                    env.dir.display()
                );
            }
            return Err(err);
        }

        info!(env = %env.name, files = env.files.len(), "created environment");
        Ok(env)
    }

    fn claim_directory(&self, base_name: &str) -> EnvResult<(String, PathBuf)> {
        for attempt in 1..=MAX_NAME_SUFFIX {
            let name = if attempt == 1 {
                base_name.to_string()
            } else {
                format!("{base_name}-{attempt}")
            };
            let dir = self.config.root.join(&name);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((name, dir)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(EnvError::io(format!(
                        "failed creating environment directory {}",
                        dir.display()
                    ))(err));
                }
            }
        }
        Err(EnvError::Io {
            context: format!("no unused directory name for '{base_name}'"),
            source: io::Error::from(io::ErrorKind::AlreadyExists),
        })
    }

    pub fn list(&self) -> EnvResult<Vec<Environment>> {
        let mut envs = Vec::new();
        for name in self.environment_names()? {
            let dir = self.config.root.join(&name);
            envs.push(self.reconcile(load_environment(&name, &dir)));
        }
        envs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(envs)
    }

    pub fn get(&self, name: &str) -> EnvResult<Environment> {
        let dir = self.env_dir(name)?;
        Ok(self.reconcile(load_environment(name, &dir)))
    }

    /// Starts a static server for `name` on the lowest usable port, or returns the running one.
    pub fn start_server(&self, name: &str, preferred_port: Option<u16>) -> EnvResult<Environment> {
        let mut env = self.get(name)?;
        if env.is_running() {
            debug!(env = %env.name, port = ?env.port, "server already running");
            return Ok(env);
        }

        let taken: BTreeSet<u16> = self
            .list()?
            .into_iter()
            .filter(|other| other.name != env.name && other.is_running())
            .filter_map(|other| other.port)
            .collect();

        let first = preferred_port.unwrap_or(self.config.base_port);
        let mut last = first;
        for port in candidate_ports(first, self.config.port_scan_limit) {
            last = port;
            if taken.contains(&port) {
                debug!(port, "port assigned to another environment");
                continue;
            }
            if !process::port_available(&self.config.host, port) {
                debug!(port, "port occupied");
                continue;
            }

            let mut child = self.spawn_server(&env, port)?;
            match wait_for_ready(&mut child, self.config.startup_timeout)? {
                Startup::Ready => {
                    env.port = Some(port);
                    env.pid = Some(child.id());
                    env.status = EnvStatus::Running;
                    write_metadata(&env)?;
                    info!(env = %env.name, port, pid = child.id(), "server started");
                    return Ok(env);
                }
                Startup::Exited(status) => {
                    if process::port_available(&self.config.host, port) {
                        return Err(EnvError::ServerExited {
                            name: env.name.clone(),
                            port,
                            status: status.to_string(),
                            log: env.dir.join(SERVER_LOG_FILE),
                        });
                    }
                    debug!(port, "lost port race, trying next candidate");
                }
                Startup::TimedOut => {
                    if let Err(err) = child.kill() {
                        warn!("failed killing unresponsive server: {err}");
                    }
                    let _ = child.wait();
                    return Err(EnvError::ServerStartTimeout {
                        name: env.name.clone(),
                        port,
                        timeout: self.config.startup_timeout,
                    });
                }
            }
        }

        Err(EnvError::NoFreePort { first, last })
    }

    fn spawn_server(&self, env: &Environment, port: u16) -> EnvResult<Child> {
        let log_path = env.dir.join(SERVER_LOG_FILE);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(EnvError::io(format!(
                "failed opening server log {}",
                log_path.display()
            )))?;

        let mut command = Command::new(&self.config.server_program);
        command
            .args(&self.config.server_args)
            .arg("--dir")
            .arg(&env.dir)
            .arg("--port")
            .arg(port.to_string())
            .arg("--host")
            .arg(&self.config.host)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        debug!(program = %self.config.server_program.display(), port, "spawning server");
        command.spawn().map_err(EnvError::io(format!(
            "failed launching server program {}",
            self.config.server_program.display()
        )))
    }

    /// Terminates the recorded server if it is still live and clears the record.
    pub fn stop_server(&self, name: &str) -> EnvResult<Environment> {
        let mut env = self.get(name)?;
        if let (EnvStatus::Running, Some(pid), Some(port)) = (env.status, env.pid, env.port) {
            process::terminate(pid)
                .map_err(EnvError::io(format!("failed stopping server pid {pid}")))?;
            if !process::wait_for_port_closed(&self.config.host, port, STOP_WAIT) {
                warn!(env = %env.name, port, "port still open after stop");
            }
            info!(env = %env.name, port, pid, "server stopped");
        }

        if env.pid.is_some() || env.port.is_some() || env.is_running() {
            env.pid = None;
            env.port = None;
            env.status = EnvStatus::Stopped;
            write_metadata(&env)?;
        }
        Ok(env)
    }

    pub fn stop_all(&self) -> EnvResult<BulkReport> {
        let mut report = BulkReport::default();
        for env in self.list()?.into_iter().filter(Environment::is_running) {
            match self.stop_server(&env.name) {
                Ok(_) => report.succeeded.push(env.name),
                Err(err) => {
                    warn!(env = %env.name, "failed stopping server: {err}");
                    report.failed.push((env.name, err));
                }
            }
        }
        Ok(report)
    }

    pub fn remove(&self, name: &str) -> EnvResult<()> {
        let env = self.get(name)?;
        if env.is_running() {
            self.stop_server(name)?;
        }
        fs::remove_dir_all(&env.dir).map_err(EnvError::io(format!(
            "failed deleting {}",
            env.dir.display()
        )))?;
        info!(env = %env.name, "removed environment");
        Ok(())
    }

    /// Removes every environment under the root, continuing past failures.
    pub fn remove_all(&self) -> EnvResult<BulkReport> {
        let mut report = BulkReport::default();
        for name in self.environment_names()? {
            match self.remove(&name) {
                Ok(()) => report.succeeded.push(name),
                Err(err) => {
                    warn!(env = %name, "failed removing environment: {err}");
                    report.failed.push((name, err));
                }
            }
        }
        Ok(report)
    }

    fn environment_names(&self) -> EnvResult<Vec<String>> {
        let root = &self.config.root;
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(EnvError::io(format!("failed reading {}", root.display()))(err));
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(EnvError::io(format!("failed reading {}", root.display())))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Only plain directory names under the root can name an environment; anything else is unknown.
    fn env_dir(&self, name: &str) -> EnvResult<PathBuf> {
        let plain = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
            && !Path::new(name).is_absolute();
        let dir = self.config.root.join(name);
        if !plain || !dir.is_dir() {
            return Err(EnvError::not_found(name));
        }
        Ok(dir)
    }

    fn reconcile(&self, mut env: Environment) -> Environment {
        let live = match (env.pid, env.port) {
            (Some(pid), Some(port)) => {
                process::is_alive(pid) && process::port_accepts(&self.config.host, port)
            }
            _ => false,
        };

        if live {
            env.status = EnvStatus::Running;
            return env;
        }

        env.status = EnvStatus::Stopped;
        if env.pid.is_some() || env.port.is_some() {
            debug!(env = %env.name, "clearing stale server record");
            env.pid = None;
            env.port = None;
            if env.metadata_path().exists() {
                if let Err(err) = write_metadata(&env) {
                    warn!(env = %env.name, "failed clearing stale server record: {err}");
                }
            }
        }
        env
    }
}

/// Ports from `first` upward, at most `limit` of them and never past 65535.
fn candidate_ports(first: u16, limit: u16) -> impl Iterator<Item = u16> {
    (0..limit).map_while(move |offset| first.checked_add(offset))
}

fn wait_for_ready(child: &mut Child, timeout: Duration) -> EnvResult<Startup> {
    let (tx, rx) = mpsc::channel::<()>();
    if let Some(stdout) = child.stdout.take() {
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if line.starts_with(READY_LINE_PREFIX) {
                    let _ = tx.send(());
                    break;
                }
            }
        });
    }

    let deadline = Instant::now() + timeout;
    loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(()) => return Ok(Startup::Ready),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => thread::sleep(Duration::from_millis(50)),
        }
        if let Some(status) = child
            .try_wait()
            .map_err(EnvError::io("failed polling server process"))?
        {
            return Ok(Startup::Exited(status));
        }
        if Instant::now() >= deadline {
            return Ok(Startup::TimedOut);
        }
    }
}

pub fn slugify(hint: &str) -> String {
    let mut slug = String::with_capacity(hint.len());
    for c in hint.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let mut slug: String = slug.chars().take(MAX_SLUG_LEN).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "site".to_string()
    } else {
        slug
    }
}

fn checked_relative_path(raw: &str) -> EnvResult<String> {
    let invalid = || EnvError::InvalidFilePath {
        path: raw.to_string(),
    };
    let path = normalize_file_path(raw).ok_or_else(invalid)?;
    if path == METADATA_FILE || path == SERVER_LOG_FILE {
        return Err(invalid());
    }
    Ok(path)
}

fn write_files(dir: &Path, files: &GeneratedFileSet) -> EnvResult<Vec<String>> {
    let mut written = Vec::with_capacity(files.len());
    for file in files.iter() {
        let relative = checked_relative_path(&file.path)?;
        let target = dir.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(EnvError::io(format!(
                "failed creating directory {}",
                parent.display()
            )))?;
        }
        fs::write(&target, file.content.as_bytes())
            .map_err(EnvError::io(format!("failed writing {}", target.display())))?;
        written.push(relative);
    }
    Ok(written)
}

fn write_metadata(env: &Environment) -> EnvResult<()> {
    let path = env.metadata_path();
    let json = serde_json::to_string_pretty(&env.record()).map_err(|source| {
        EnvError::Metadata {
            path: path.clone(),
            source,
        }
    })?;
    let tmp = env.dir.join(format!("{METADATA_FILE}.tmp"));
    fs::write(&tmp, json).map_err(EnvError::io(format!("failed writing {}", tmp.display())))?;
    fs::rename(&tmp, &path).map_err(EnvError::io(format!("failed writing {}", path.display())))
}

/// Loads an environment from disk; unreadable metadata degrades to a stopped entry.
fn load_environment(name: &str, dir: &Path) -> Environment {
    let path = dir.join(METADATA_FILE);
    let record = fs::read_to_string(&path)
        .ok()
        .and_then(|raw| match serde_json::from_str::<MetadataRecord>(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!("ignoring malformed metadata {}: {err}", path.display());
                None
            }
        });

    match record {
        Some(record) => Environment {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            port: record.port,
            pid: record.pid,
            status: EnvStatus::Stopped,
            created_at: record.created_at,
            source: record.source,
            files: record.files,
        },
        None => Environment {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            port: None,
            pid: None,
            status: EnvStatus::Stopped,
            created_at: dir_created_at(dir),
            source: None,
            files: collect_files(dir, dir),
        },
    }
}

fn dir_created_at(dir: &Path) -> DateTime<Utc> {
    fs::metadata(dir)
        .and_then(|meta| meta.created().or_else(|_| meta.modified()))
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

fn collect_files(root: &Path, dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden {
            continue;
        }
        if path.is_dir() {
            files.extend(collect_files(root, &path));
        } else if let Ok(relative) = path.strip_prefix(root) {
            files.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    files.sort();
    files
}
