use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::config::AppConfig;
use crate::events::{EventBus, GatewayEvent, LogLine, LogStream};
use crate::logger::{log_host, Logger};

const MIN_BACKOFF_MS: u64 = 2000;
const BACKOFF_STEP_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 30_000;

/// §4.6's health state, shared with the event bus so subscribers see the same enum C6 computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
  Unknown,
  Healthy,
  Unhealthy,
}

/// Per-app supervised process state (§4.5). One `AppProcess` per configured app with a `start`
/// command; apps that are pure reverse-proxy or static targets never get one.
struct AppProcess {
  host: String,
  child: Option<Child>,
  restart_count: u32,
  manual_stop: bool,
  /// True while a `spawn_with_supervision` loop task is alive for this host. A manual stop (or
  /// `autoRestart == false` after a non-zero exit) lets that loop return, so [`Supervisor::restart`]
  /// needs this to tell "kill the current child, the loop will restart it" apart from "the loop
  /// already ended, a fresh one must be spawned".
  loop_running: bool,
  max_logs: usize,
  logs: VecDeque<LogLine>,
}

impl AppProcess {
  fn new(host: String, max_logs: usize) -> Self {
    Self {
      host,
      child: None,
      restart_count: 0,
      manual_stop: false,
      loop_running: false,
      max_logs,
      logs: VecDeque::with_capacity(max_logs),
    }
  }

  fn push_log(&mut self, line: LogLine) {
    if self.logs.len() == self.max_logs {
      self.logs.pop_front();
    }
    self.logs.push_back(line);
  }
}

/// C5 — owns the lifecycle of every app that declares a `start` command: spawn, restart with
/// backoff, capture stdout/stderr into a ring buffer, and honor a manual stop/start distinct from
/// crash-triggered restarts.
pub struct Supervisor {
  bus: EventBus,
  logger: Logger,
  processes: RwLock<HashMap<String, Arc<RwLock<AppProcess>>>>,
}

impl Supervisor {
  pub fn new(bus: EventBus, logger: Logger) -> Arc<Self> {
    Arc::new(Self { bus, logger, processes: RwLock::new(HashMap::new()) })
  }

  /// Starts supervising `app` if it declares a `start` command and is not `disabled`. Idempotent:
  /// calling it again for an already-supervised host is a no-op (use [`Supervisor::restart`] or
  /// [`Supervisor::stop`] to change a running app's state).
  pub async fn supervise(self: &Arc<Self>, app: Arc<AppConfig>) -> Result<()> {
    let Some(start_command) = app.start.clone() else {
      return Ok(());
    };
    if app.disabled {
      return Ok(());
    }

    let host = app.host_key();
    if self.processes.read().await.contains_key(&host) {
      return Ok(());
    }

    let process = Arc::new(RwLock::new(AppProcess::new(host.clone(), app.max_logs())));
    self.processes.write().await.insert(host.clone(), process.clone());

    // §4.5 step 3: a failed dependency bootstrap is logged but never prevents the spawn below.
    if app.auto_install {
      if let Err(err) = self.run_auto_install(&app).await {
        log_host(&self.logger, &host, format!("continuing to start despite install failure: {err:#}"), true);
      }
    }

    self.spawn_with_supervision(app, process, start_command);
    Ok(())
  }

  async fn run_auto_install(&self, app: &AppConfig) -> Result<()> {
    let Some(cwd) = &app.cwd else {
      return Ok(());
    };
    if cwd.join("node_modules").exists() || !cwd.join("package.json").exists() {
      return Ok(());
    }
    log_host(&self.logger, &app.host_key(), "running npm install before first start", false);
    let status = Command::new("npm").arg("install").current_dir(cwd).status().await;
    match status {
      Ok(status) if status.success() => Ok(()),
      Ok(status) => {
        log_host(&self.logger, &app.host_key(), format!("npm install exited with status {status}"), true);
        Err(anyhow!("npm install exited with status {status}"))
      }
      Err(err) => {
        log_host(&self.logger, &app.host_key(), format!("failed to run npm install: {err}"), true);
        Err(anyhow!("failed to run npm install: {err}"))
      }
    }
  }

  fn spawn_with_supervision(self: &Arc<Self>, app: Arc<AppConfig>, process: Arc<RwLock<AppProcess>>, start_command: String) {
    let this = self.clone();
    tokio::spawn(async move {
      process.write().await.loop_running = true;

      loop {
        {
          let guard = process.read().await;
          if guard.manual_stop {
            break;
          }
        }

        let exit_code = match this.spawn_once(&app, &start_command, &process).await {
          Ok(exit_code) => {
            this.bus.publish(GatewayEvent::AppExit { host: app.host_key(), code: exit_code });
            exit_code
          }
          Err(err) => {
            log_host(&this.logger, &app.host_key(), format!("failed to start: {err}"), true);
            this.bus.publish(GatewayEvent::AppExit { host: app.host_key(), code: None });
            None
          }
        };

        let manual_stop = process.read().await.manual_stop;
        // §4.5 step 6: autorestart iff not manual, autoRestart != false, not disabled, exit
        // code != 0. `disabled` already gated entry into `supervise`, so it can't flip true here.
        let should_restart = !manual_stop && app.auto_restart && exit_code != Some(0);
        if !should_restart {
          break;
        }

        let restart_count = {
          let mut guard = process.write().await;
          guard.restart_count += 1;
          guard.restart_count
        };
        let backoff = backoff_for(restart_count);
        log_host(&this.logger, &app.host_key(), format!("restarting in {}ms (attempt {restart_count})", backoff.as_millis()), false);
        sleep(backoff).await;
      }

      process.write().await.loop_running = false;
    });
  }

  /// Spawns the process once, wires up stdout/stderr capture tasks, and awaits its exit.
  async fn spawn_once(self: &Arc<Self>, app: &AppConfig, start_command: &str, process: &Arc<RwLock<AppProcess>>) -> Result<Option<i32>> {
    if let Some(port) = app.port {
      if port_in_use(port).await {
        return Err(anyhow!("port {port} is already in use"));
      }
    }

    let raw_tokens = shell_split(start_command)?;
    let (raw_program, _) = raw_tokens.split_first().ok_or_else(|| anyhow!("empty start command"))?;
    let is_npm_launcher = NPM_LAUNCHERS.contains(&raw_program.as_str());

    // §4.5 step 4, first attempt: the literal `start` command as configured, shell-wrapped on
    // platforms where the launcher name requires one (npm/npx/pnpm/yarn are `.cmd` shims on
    // Windows that the process loader can't exec directly).
    let mut command = if needs_shell(raw_program) {
      shell_wrapped_command(start_command)
    } else {
      command_from_tokens(&raw_tokens)?
    };
    apply_cwd_and_env(&mut command, app.cwd.as_deref());
    command.stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

    let mut child = match command.spawn() {
      Ok(child) => child,
      // Second attempt: the same literal command line, but without the shell wrapper.
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
        let mut direct = command_from_tokens(&raw_tokens)?;
        apply_cwd_and_env(&mut direct, app.cwd.as_deref());
        direct.stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

        match direct.spawn() {
          Ok(child) => child,
          // Third attempt, npm-like launchers only: resolve the underlying package.json script
          // and exec its interpreter directly, bypassing the npm wrapper entirely.
          Err(err) if err.kind() == std::io::ErrorKind::NotFound && is_npm_launcher => {
            let tokens = resolve_start_tokens(start_command, app.cwd.as_deref()).await?;
            let mut substituted = command_from_tokens(&tokens)?;
            apply_cwd_and_env(&mut substituted, app.cwd.as_deref());
            substituted.stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
            substituted.spawn().map_err(|err| anyhow!("failed to spawn \"{start_command}\": {err}"))?
          }
          Err(err) => return Err(anyhow!("failed to spawn \"{start_command}\": {err}")),
        }
      }
      Err(err) => return Err(anyhow!("failed to spawn \"{start_command}\": {err}")),
    };
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    self.bus.publish(GatewayEvent::AppStart { host: app.host_key() });
    log_host(&self.logger, &app.host_key(), format!("started: {start_command}"), false);

    if let Some(stdout) = stdout {
      self.spawn_log_pump(app.host_key(), process.clone(), stdout, LogStream::Stdout);
    }
    if let Some(stderr) = stderr {
      self.spawn_log_pump(app.host_key(), process.clone(), stderr, LogStream::Stderr);
    }

    {
      let mut guard = process.write().await;
      guard.child = Some(child);
    }

    let mut guard = process.write().await;
    let child = guard.child.as_mut().expect("child was just set");
    let status = child.wait().await?;
    guard.child = None;
    Ok(status.code())
  }

  fn spawn_log_pump<R>(&self, host: String, process: Arc<RwLock<AppProcess>>, reader: R, stream: LogStream)
  where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
  {
    let bus = self.bus.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(reader).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        let log_line = LogLine { stream, line };
        process.write().await.push_log(log_line.clone());
        bus.publish(GatewayEvent::AppLog { host: host.clone(), line: log_line });
      }
    });
  }

  /// Sets the manual-stop flag and kills the current child, if any. The supervision loop sees
  /// the flag on its next iteration and does not restart.
  pub async fn stop(&self, host: &str) -> Result<()> {
    let Some(process) = self.processes.read().await.get(host).cloned() else {
      return Ok(());
    };
    let mut guard = process.write().await;
    guard.manual_stop = true;
    if let Some(child) = guard.child.as_mut() {
      let _ = child.start_kill();
    }
    self.bus.publish(GatewayEvent::AppStop { host: host.to_string() });
    Ok(())
  }

  /// Clears the manual-stop flag and brings the app back up: §4.5's `restart(host) = stop +
  /// delayed start`. If the supervision loop is still alive (the app was merely crash-looping or
  /// running), killing its current child is enough — the loop's own restart path brings it back
  /// since `manual_stop` is now false. If the loop already exited (a prior manual `stop` let it
  /// return), a fresh loop has to be spawned explicitly; `supervise` won't do it because it treats
  /// an already-known host as a no-op.
  pub async fn restart(self: &Arc<Self>, app: Arc<AppConfig>) -> Result<()> {
    let Some(start_command) = app.start.clone() else {
      return Ok(());
    };
    let host = app.host_key();

    let Some(process) = self.processes.read().await.get(&host).cloned() else {
      return self.supervise(app).await;
    };

    let needs_fresh_loop = {
      let mut guard = process.write().await;
      guard.manual_stop = false;
      guard.restart_count = 0;
      if let Some(child) = guard.child.as_mut() {
        let _ = child.start_kill();
      }
      !guard.loop_running
    };

    if needs_fresh_loop {
      self.spawn_with_supervision(app, process, start_command);
    }
    Ok(())
  }

  /// Stops every supervised host, for use during process shutdown (§5: "terminate all supervised
  /// children" before exit).
  pub async fn shutdown_all(&self) {
    let hosts: Vec<String> = self.processes.read().await.keys().cloned().collect();
    for host in hosts {
      let _ = self.stop(&host).await;
    }
  }

  /// §4.9 step 1: whether `host` currently has a live child. Apps with no `start` command (pure
  /// proxy/static targets, or externally managed processes) are never tracked here, so this only
  /// ever gates apps that declared supervision in the first place — callers check `app.start`
  /// before consulting this.
  pub async fn is_running(&self, host: &str) -> bool {
    let Some(process) = self.processes.read().await.get(host).cloned() else {
      return false;
    };
    process.read().await.child.is_some()
  }

  pub async fn recent_logs(&self, host: &str) -> Vec<LogLine> {
    let Some(process) = self.processes.read().await.get(host).cloned() else {
      return Vec::new();
    };
    process.read().await.logs.iter().cloned().collect()
  }
}

fn backoff_for(restart_count: u32) -> Duration {
  let ms = MIN_BACKOFF_MS + u64::from(restart_count) * BACKOFF_STEP_MS;
  Duration::from_millis(ms.min(MAX_BACKOFF_MS))
}

async fn port_in_use(port: u16) -> bool {
  TcpListener::bind(("127.0.0.1", port)).await.is_err()
}

const NPM_LAUNCHERS: &[&str] = &["npm", "npx", "pnpm", "yarn"];
const FORBIDDEN_SCRIPT_CHARS: &[char] = &['&', '|', '>', '<', ';', '`', '$', '(', ')', '{', '}', '[', ']'];

/// True when `program` is a launcher that can't be exec'd directly on this platform and needs a
/// shell to resolve it (§4.5 step 4: "on platforms where launcher names require a shell, use
/// one"). npm/npx/pnpm/yarn ship as `.cmd` shims on Windows, which the process loader can't exec
/// without `cmd.exe`; on every other platform they're plain executable scripts on `PATH`.
fn needs_shell(program: &str) -> bool {
  cfg!(windows) && NPM_LAUNCHERS.contains(&program)
}

/// Wraps `start_command` for `cmd.exe /C` so a `.cmd`/`.bat` launcher resolves the way it would
/// from an interactive Windows shell.
fn shell_wrapped_command(start_command: &str) -> Command {
  let mut command = Command::new("cmd");
  command.arg("/C").arg(start_command);
  command
}

/// Builds a `Command` from already-tokenized arguments with no shell and no npm substitution.
fn command_from_tokens(tokens: &[String]) -> Result<Command> {
  let (program, args) = tokens.split_first().ok_or_else(|| anyhow!("empty start command"))?;
  let mut command = Command::new(program);
  command.args(args);
  Ok(command)
}

/// Resolves a bare `npm start` / `npm run <script>` (and `pnpm`/`yarn`/`npx` equivalents) to a
/// direct execution of the underlying script, so the supervised child is the actual server
/// process rather than an npm wrapper shell that swallows signals (§4.5 step 1). Returns the raw
/// tokenized command unchanged when no such substitution applies.
async fn resolve_start_tokens(start_command: &str, cwd: Option<&Path>) -> Result<Vec<String>> {
  let tokens = shell_split(start_command)?;
  let (program, args) = tokens.split_first().ok_or_else(|| anyhow!("empty start command"))?;

  if NPM_LAUNCHERS.contains(&program.as_str()) {
    if let Some(cwd) = cwd {
      if let Some(script_body) = npm_script_body(cwd, args).await {
        if is_transparently_executable(&script_body) {
          return shell_split(&script_body);
        }
      }
    }
  }
  Ok(tokens)
}

/// A script body is safe to run directly (no wrapping shell) only if it is a single bare command
/// line: no shell operators and none of the metacharacters a shell would otherwise interpret.
fn is_transparently_executable(script: &str) -> bool {
  !script.contains("&&") && !script.contains("||") && !script.contains(FORBIDDEN_SCRIPT_CHARS)
}

/// Resolves `npm start` / `npm run <script>` (and the `pnpm`/`yarn`/`npx` equivalents) against
/// `<cwd>/package.json`'s `scripts` map. Returns `None` if there's no `package.json`, no matching
/// script, or the script body isn't a plain command.
async fn npm_script_body(cwd: &Path, args: &[String]) -> Option<String> {
  let script_name = match args.first().map(String::as_str) {
    Some("start") => "start",
    Some("run") => args.get(1)?.as_str(),
    _ => return None,
  };
  let contents = tokio::fs::read_to_string(cwd.join("package.json")).await.ok()?;
  let manifest: serde_json::Value = serde_json::from_str(&contents).ok()?;
  manifest.get("scripts")?.get(script_name)?.as_str().map(str::to_string)
}

/// Sets the child's working directory (if configured) and augments its environment, shared by
/// every spawn attempt in `spawn_once` so the three retry stages stay in sync.
fn apply_cwd_and_env(command: &mut Command, cwd: Option<&Path>) {
  if let Some(cwd) = cwd {
    command.current_dir(cwd);
  }
  apply_child_environment(command);
}

/// §4.5 step 4: augments the inherited environment with the platform's node install directory
/// prepended to `PATH`, and defaults `NODE_ENV` to `production` when the parent process didn't
/// already have one set (§6's environment-variable table).
fn apply_child_environment(command: &mut Command) {
  if std::env::var_os("NODE_ENV").is_none() {
    command.env("NODE_ENV", "production");
  }
  let separator = if cfg!(windows) { ';' } else { ':' };
  let node_install_dir = if cfg!(windows) { r"C:\Program Files\nodejs" } else { "/usr/local/bin" };
  let path = std::env::var("PATH").unwrap_or_default();
  command.env("PATH", format!("{node_install_dir}{separator}{path}"));
}

fn shell_split(input: &str) -> Result<Vec<String>> {
  let mut tokens = Vec::new();
  let mut current = String::new();
  let mut chars = input.chars().peekable();
  let mut in_single = false;
  let mut in_double = false;
  let mut has_token = false;

  while let Some(ch) = chars.next() {
    match ch {
      '\'' if !in_double => {
        in_single = !in_single;
        has_token = true;
      }
      '"' if !in_single => {
        in_double = !in_double;
        has_token = true;
      }
      c if c.is_whitespace() && !in_single && !in_double => {
        if has_token {
          tokens.push(std::mem::take(&mut current));
          has_token = false;
        }
      }
      c => {
        current.push(c);
        has_token = true;
      }
    }
  }
  if in_single || in_double {
    return Err(anyhow!("unterminated quote in start command"));
  }
  if has_token {
    tokens.push(current);
  }
  Ok(tokens)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn backoff_grows_then_caps() {
    assert_eq!(backoff_for(0), Duration::from_millis(2000));
    assert_eq!(backoff_for(5), Duration::from_millis(7000));
    assert_eq!(backoff_for(1000), Duration::from_millis(MAX_BACKOFF_MS));
  }

  #[test]
  fn shell_split_handles_quotes() {
    let tokens = shell_split(r#"node server.js --name "my app" --flag"#).unwrap();
    assert_eq!(tokens, vec!["node", "server.js", "--name", "my app", "--flag"]);
  }

  #[test]
  fn shell_split_rejects_unterminated_quote() {
    assert!(shell_split(r#"node "server"#).is_err());
  }

  #[test]
  fn needs_shell_is_windows_only_and_launcher_specific() {
    assert_eq!(needs_shell("npm"), cfg!(windows));
    assert_eq!(needs_shell("node"), false);
  }

  #[test]
  fn rejects_scripts_with_shell_metacharacters() {
    assert!(is_transparently_executable("node server.js"));
    assert!(!is_transparently_executable("node a.js && node b.js"));
    assert!(!is_transparently_executable("node server.js > out.log"));
    assert!(!is_transparently_executable("echo $HOME"));
  }

  #[tokio::test]
  async fn npm_start_substitutes_package_json_script() {
    let dir = std::env::temp_dir().join(format!("hostgate-supervisor-test-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(&dir.join("package.json"), r#"{"scripts": {"start": "node dist/server.js --port 4000"}}"#)
      .await
      .unwrap();

    let tokens = resolve_start_tokens("npm start", Some(&dir)).await.unwrap();
    assert_eq!(tokens, vec!["node", "dist/server.js", "--port", "4000"]);

    tokio::fs::remove_dir_all(&dir).await.unwrap();
  }

  #[tokio::test]
  async fn npm_run_with_unsafe_script_is_left_as_npm_invocation() {
    let dir = std::env::temp_dir().join(format!("hostgate-supervisor-test-unsafe-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(&dir.join("package.json"), r#"{"scripts": {"build-and-start": "npm run build && node server.js"}}"#)
      .await
      .unwrap();

    let tokens = resolve_start_tokens("npm run build-and-start", Some(&dir)).await.unwrap();
    assert_eq!(tokens, vec!["npm", "run", "build-and-start"]);

    tokio::fs::remove_dir_all(&dir).await.unwrap();
  }
}
