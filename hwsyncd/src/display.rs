//! Display mode discovery and control for X11 sessions
//!
//! The graphical session is recovered from the environment of the session
//! user's processes. Modes are read from `xrandr -q --current` and changed
//! with `xrandr --output <panel>`. Wayland sessions are reported as
//! unsupported and every operation turns into a no-op.

use async_trait::async_trait;
use hwsync_common::{tracing, DisplayMode, DisplayModesReport};
use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::DisplayOptions;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while talking to the display tool
#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{program} timed out")]
    Timeout { program: String },
}

/// Display protocol of the graphical session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKind {
    X11,
    Wayland,
    #[default]
    Unknown,
}

impl SessionKind {
    fn from_marker(marker: &str) -> Self {
        match marker.trim().to_lowercase().as_str() {
            "x11" => SessionKind::X11,
            "wayland" => SessionKind::Wayland,
            _ => SessionKind::Unknown,
        }
    }
}

/// Graphical session found in the process table
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplaySession {
    pub kind: SessionKind,
    /// `DISPLAY` value, e.g. `:0`
    pub display: String,
    /// `XAUTHORITY` file, only set if it exists
    pub authority: Option<PathBuf>,
}

impl DisplaySession {
    /// Whether display modes can be queried and changed in this session
    pub fn is_usable(&self) -> bool {
        self.kind == SessionKind::X11 && !self.display.is_empty() && self.authority.is_some()
    }
}

/// Scan the environment of every process owned by `uid` under `proc_root`.
///
/// Processes are visited in pid order and the first non-empty value of each
/// variable is kept.
pub async fn discover_session(proc_root: &Path, uid: u32) -> DisplaySession {
    let mut display = None;
    let mut authority = None;
    let mut session_type = None;

    for pid in process_ids(proc_root).await {
        let dir = proc_root.join(pid.to_string());
        match fs::metadata(&dir).await {
            Ok(metadata) if metadata.uid() == uid => {}
            _ => continue,
        }
        let Ok(environ) = fs::read(dir.join("environ")).await else {
            continue;
        };

        for entry in environ.split(|byte| *byte == 0) {
            let entry = String::from_utf8_lossy(entry);
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let slot = match key {
                "DISPLAY" => &mut display,
                "XAUTHORITY" => &mut authority,
                "XDG_SESSION_TYPE" => &mut session_type,
                _ => continue,
            };
            slot.get_or_insert_with(|| value.to_string());
        }

        if display.is_some() && authority.is_some() && session_type.is_some() {
            break;
        }
    }

    let authority = match authority {
        Some(path) if fs::metadata(&path).await.is_ok() => Some(PathBuf::from(path)),
        Some(path) => {
            debug!("XAUTHORITY file {} does not exist", path);
            None
        }
        None => None,
    };

    DisplaySession {
        kind: session_type.as_deref().map(SessionKind::from_marker).unwrap_or_default(),
        display: display.unwrap_or_default(),
        authority,
    }
}

async fn process_ids(proc_root: &Path) -> Vec<u32> {
    let mut pids = Vec::new();
    let Ok(mut entries) = fs::read_dir(proc_root).await else {
        warn!("Cannot read process table at {}", proc_root.display());
        return pids;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse().ok()) {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    pids
}

/// Parse `xrandr -q --current` output.
///
/// Returns `None` if no built-in panel (`eDP*`, `LVDS*`) is listed. Modes are
/// the mode lines directly following the panel line.
pub fn parse_query_output(output: &str) -> Option<DisplayModesReport> {
    let mut lines = output.lines();
    let panel = lines.by_ref().find_map(panel_name)?;

    let mut report = DisplayModesReport {
        display_name: panel.to_string(),
        ..DisplayModesReport::default()
    };
    for line in lines {
        let Some((mode, active_rate)) = parse_mode_line(line) else {
            break;
        };
        // A later current marker overrides an earlier one
        if let Some(rate) = active_rate {
            report.active_mode = DisplayMode {
                x_resolution: mode.x_resolution,
                y_resolution: mode.y_resolution,
                refresh_rates: vec![rate],
            };
        }
        report.display_modes.push(mode);
    }
    Some(report)
}

fn panel_name(line: &str) -> Option<&str> {
    line.split_whitespace().find_map(|token| {
        let start = ["eDP", "LVDS"]
            .iter()
            .filter_map(|prefix| token.find(prefix))
            .min()?;
        Some(&token[start..])
    })
}

/// `  WIDTHxHEIGHT[i]  RATE[*][+] ...`, with the first rate marked `*` as the active one
fn parse_mode_line(line: &str) -> Option<(DisplayMode, Option<f64>)> {
    if !line.starts_with(char::is_whitespace) {
        return None;
    }
    let mut tokens = line.split_whitespace();
    let (x_resolution, y_resolution) = parse_resolution(tokens.next()?)?;

    let mut refresh_rates = Vec::new();
    let mut active = None;
    for token in tokens {
        if token.chars().all(|c| c == '*' || c == '+') {
            continue;
        }
        let Some((rate, current)) = parse_rate(token) else {
            break;
        };
        if current && active.is_none() {
            active = Some(rate);
        }
        if !refresh_rates.contains(&rate) {
            refresh_rates.push(rate);
        }
    }
    if refresh_rates.is_empty() {
        return None;
    }

    let mode = DisplayMode {
        x_resolution,
        y_resolution,
        refresh_rates,
    };
    Some((mode, active))
}

fn parse_resolution(token: &str) -> Option<(u32, u32)> {
    let (width, height) = token.split_once('x')?;
    let height = match height.strip_suffix(|c: char| c.is_ascii_lowercase()) {
        Some(stripped) => stripped,
        None => height,
    };
    if !is_digits(width, 3..=4) || !is_digits(height, 3..=4) {
        return None;
    }
    Some((width.parse().ok()?, height.parse().ok()?))
}

/// `165.00*+` -> `(165.0, true)`
fn parse_rate(token: &str) -> Option<(f64, bool)> {
    let token = token.strip_suffix('+').unwrap_or(token);
    let (token, current) = match token.strip_suffix('*') {
        Some(stripped) => (stripped, true),
        None => (token, false),
    };
    let (whole, fraction) = token.split_once('.')?;
    if !is_digits(whole, 1..=3) || !is_digits(fraction, 2..=2) {
        return None;
    }
    Some((token.parse().ok()?, current))
}

fn is_digits(text: &str, len: std::ops::RangeInclusive<usize>) -> bool {
    len.contains(&text.len()) && text.bytes().all(|b| b.is_ascii_digit())
}

/// A display tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runs display tool invocations and returns their standard output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<String, DisplayError>;
}

/// Runs invocations as child processes, without a shell
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<String, DisplayError> {
        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            Command::new(&invocation.program)
                .args(&invocation.args)
                .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| DisplayError::Timeout {
            program: invocation.program.clone(),
        })?
        .map_err(|source| DisplayError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(DisplayError::Failed {
                program: invocation.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Display modes of the built-in panel
pub struct DisplayController {
    proc_root: PathBuf,
    command: String,
    uid: u32,
    runner: Arc<dyn CommandRunner>,
    /// Panel found by the last successful query
    panel: Mutex<Option<String>>,
}

impl DisplayController {
    /// Controller for sessions of `uid`
    pub fn new(options: &DisplayOptions, uid: u32, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            proc_root: options.proc_root.clone(),
            command: options.command.clone(),
            uid,
            runner,
            panel: Mutex::new(None),
        }
    }

    /// The current graphical session, derived fresh on every call
    pub async fn session(&self) -> DisplaySession {
        discover_session(&self.proc_root, self.uid).await
    }

    /// Supported and active modes, `None` outside a usable X11 session or if
    /// the query fails
    pub async fn display_modes(&self) -> Option<DisplayModesReport> {
        let session = self.session().await;
        if !session.is_usable() {
            debug!("No usable X11 session ({:?}), display modes unavailable", session.kind);
            self.set_panel(None);
            return None;
        }

        let invocation = self.invocation(&session, ["-q", "-display", session.display.as_str(), "--current"]);
        let output = match self.runner.run(&invocation).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Display mode query failed: {}", e);
                return None;
            }
        };

        let report = parse_query_output(&output);
        match &report {
            Some(report) => {
                debug!("Found {} modes on {}", report.display_modes.len(), report.display_name);
                self.set_panel(Some(report.display_name.clone()));
            }
            None => debug!("No built-in panel in display query output"),
        }
        report
    }

    pub async fn set_refresh_rate(&self, rate: f64) {
        self.apply(&["-r".to_string(), rate.to_string()]).await
    }

    pub async fn set_resolution(&self, x_resolution: u32, y_resolution: u32) {
        self.apply(&["--mode".to_string(), format!("{}x{}", x_resolution, y_resolution)])
            .await
    }

    pub async fn set_refresh_resolution(&self, x_resolution: u32, y_resolution: u32, rate: f64) {
        self.apply(&[
            "--mode".to_string(),
            format!("{}x{}", x_resolution, y_resolution),
            "-r".to_string(),
            rate.to_string(),
        ])
        .await
    }

    /// Fire-and-forget mode change on the cached panel
    async fn apply(&self, change: &[String]) {
        let session = self.session().await;
        if !session.is_usable() {
            debug!("No usable X11 session, ignoring mode change");
            return;
        }
        let Some(panel) = self.panel() else {
            debug!("No panel discovered yet, ignoring mode change");
            return;
        };

        let mut args = vec!["-display", session.display.as_str(), "--output", panel.as_str()];
        args.extend(change.iter().map(String::as_str));
        let invocation = self.invocation(&session, args);

        info!("Changing display mode: {}", invocation);
        if let Err(e) = self.runner.run(&invocation).await {
            warn!("Display mode change failed: {}", e);
        }
    }

    fn invocation<'a>(&self, session: &DisplaySession, args: impl IntoIterator<Item = &'a str>) -> Invocation {
        let env = session
            .authority
            .iter()
            .map(|path| ("XAUTHORITY".to_string(), path.to_string_lossy().into_owned()))
            .collect();
        Invocation {
            program: self.command.clone(),
            args: args.into_iter().map(str::to_string).collect(),
            env,
        }
    }

    fn panel(&self) -> Option<String> {
        self.panel.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_panel(&self, panel: Option<String>) {
        *self.panel.lock().unwrap_or_else(PoisonError::into_inner) = panel;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const QUERY_OUTPUT: &str = "\
Screen 0: minimum 320 x 200, current 2560 x 1440, maximum 16384 x 16384
   eDP-1 connected primary 2560x1440+0+0 (normal left inverted right x axis y axis) 344mm x 194mm
  2560x1440   165.00*+   40.00 +
  1920x1080     60.01    59.97    59.96    60.00
  1920x1080i    60.00    60.00    50.00
  1280x720      60.00    59.99
HDMI-1 disconnected (normal left inverted right x axis y axis)
  800x600       60.32
";

    #[test]
    fn test_literal_mode_line() {
        let output = "   eDP-1 connected primary ...\n  2560x1440   165.00*+   40.00 +\n";
        let report = parse_query_output(output).unwrap();

        assert_eq!(report.display_name, "eDP-1");
        assert_eq!(
            report.display_modes,
            vec![DisplayMode {
                x_resolution: 2560,
                y_resolution: 1440,
                refresh_rates: vec![165.0, 40.0],
            }]
        );
        assert_eq!(
            report.active_mode,
            DisplayMode {
                x_resolution: 2560,
                y_resolution: 1440,
                refresh_rates: vec![165.0],
            }
        );
    }

    #[test]
    fn test_full_query_output() {
        let report = parse_query_output(QUERY_OUTPUT).unwrap();

        assert_eq!(report.display_modes.len(), 4);
        // Rates are deduplicated within a mode
        assert_eq!(report.display_modes[2].refresh_rates, vec![60.0, 50.0]);
        assert_eq!(report.display_modes[2].x_resolution, 1920);
        // Parsing stops at the next output
        assert!(report.display_modes.iter().all(|m| m.x_resolution != 800));
        assert_eq!(report.active_mode.refresh_rates, vec![165.0]);
    }

    #[test]
    fn test_last_active_marker_wins() {
        let output = "LVDS1 connected\n  1920x1080     60.00*\n  1280x720      50.00    30.00*\n";
        let report = parse_query_output(output).unwrap();

        assert_eq!(report.display_name, "LVDS1");
        assert_eq!(report.active_mode.x_resolution, 1280);
        assert_eq!(report.active_mode.refresh_rates, vec![30.0]);
    }

    #[test]
    fn test_no_active_marker_leaves_zero_mode() {
        let output = "eDP connected\n  1920x1080     60.00 +  48.00\n";
        let report = parse_query_output(output).unwrap();

        assert_eq!(report.display_modes[0].refresh_rates, vec![60.0, 48.0]);
        assert_eq!(report.active_mode, DisplayMode::default());
    }

    #[test]
    fn test_missing_panel() {
        assert_eq!(parse_query_output("HDMI-1 connected\n  1920x1080  60.00*\n"), None);
        assert_eq!(parse_query_output(""), None);
    }

    #[test]
    fn test_mode_line_grammar() {
        assert!(parse_mode_line("1920x1080 60.00").is_none());
        assert!(parse_mode_line("  19200x1080 60.00").is_none());
        assert!(parse_mode_line("  1920x1080").is_none());
        assert!(parse_mode_line("  1920x1080  60.0").is_none());
        assert_eq!(parse_rate("59.94*"), Some((59.94, true)));
        assert_eq!(parse_rate("120.00+"), Some((120.0, false)));
        assert_eq!(parse_rate("1200.00"), None);
    }

    fn write_process(proc_root: &Path, pid: u32, environ: &[&str]) {
        let dir = proc_root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let mut content = environ.join("\0");
        content.push('\0');
        std::fs::write(dir.join("environ"), content).unwrap();
    }

    fn current_uid() -> u32 {
        nix::unistd::geteuid().as_raw()
    }

    #[tokio::test]
    async fn test_session_discovery() {
        let root = TempDir::new().unwrap();
        let proc_root = root.path().join("proc");
        let xauth = root.path().join("Xauthority");
        std::fs::write(&xauth, "cookie").unwrap();

        write_process(&proc_root, 1200, &["DISPLAY=:1", "XDG_SESSION_TYPE=wayland"]);
        write_process(&proc_root, 900, &["HOME=/home/user", "DISPLAY=", "XDG_SESSION_TYPE=X11"]);
        write_process(&proc_root, 950, &["DISPLAY=:0", &format!("XAUTHORITY={}", xauth.display())]);
        std::fs::create_dir_all(proc_root.join("self")).unwrap();

        let session = discover_session(&proc_root, current_uid()).await;
        assert_eq!(session.kind, SessionKind::X11);
        assert_eq!(session.display, ":0");
        assert_eq!(session.authority, Some(xauth));
        assert!(session.is_usable());
    }

    #[tokio::test]
    async fn test_session_requires_existing_authority() {
        let root = TempDir::new().unwrap();
        write_process(
            root.path(),
            10,
            &["DISPLAY=:0", "XAUTHORITY=/nonexistent/.Xauthority", "XDG_SESSION_TYPE=x11"],
        );

        let session = discover_session(root.path(), current_uid()).await;
        assert_eq!(session.authority, None);
        assert!(!session.is_usable());
    }

    #[tokio::test]
    async fn test_other_users_are_ignored() {
        let root = TempDir::new().unwrap();
        write_process(root.path(), 10, &["DISPLAY=:0", "XDG_SESSION_TYPE=x11"]);

        let session = discover_session(root.path(), current_uid().wrapping_add(1)).await;
        assert_eq!(session, DisplaySession::default());
    }

    struct ScriptedRunner {
        output: Option<String>,
        calls: Mutex<Vec<Invocation>>,
    }

    impl ScriptedRunner {
        fn new(output: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                output: output.map(str::to_string),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, invocation: &Invocation) -> Result<String, DisplayError> {
            self.calls.lock().unwrap().push(invocation.clone());
            self.output.clone().ok_or_else(|| DisplayError::Spawn {
                program: invocation.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not installed"),
            })
        }
    }

    fn x11_controller(root: &TempDir, runner: Arc<ScriptedRunner>) -> DisplayController {
        let xauth = root.path().join("Xauthority");
        std::fs::write(&xauth, "cookie").unwrap();
        let proc_root = root.path().join("proc");
        write_process(
            &proc_root,
            42,
            &["DISPLAY=:0", &format!("XAUTHORITY={}", xauth.display()), "XDG_SESSION_TYPE=x11"],
        );
        let options = DisplayOptions {
            proc_root,
            ..DisplayOptions::default()
        };
        DisplayController::new(&options, current_uid(), runner)
    }

    #[tokio::test]
    async fn test_query_then_set_modes() {
        let root = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(Some(QUERY_OUTPUT));
        let controller = x11_controller(&root, runner.clone());

        // Without a discovered panel mode changes are ignored
        controller.set_refresh_rate(60.0).await;
        assert!(runner.calls().is_empty());

        let report = controller.display_modes().await.unwrap();
        assert_eq!(report.display_name, "eDP-1");

        controller.set_refresh_rate(59.97).await;
        controller.set_resolution(1920, 1080).await;
        controller.set_refresh_resolution(1280, 720, 60.0).await;

        let calls = runner.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0].args, vec!["-q", "-display", ":0", "--current"]);
        assert_eq!(calls[0].env[0].0, "XAUTHORITY");
        assert_eq!(calls[1].to_string(), "xrandr -display :0 --output eDP-1 -r 59.97");
        assert_eq!(calls[2].to_string(), "xrandr -display :0 --output eDP-1 --mode 1920x1080");
        assert_eq!(
            calls[3].to_string(),
            "xrandr -display :0 --output eDP-1 --mode 1280x720 -r 60"
        );
    }

    #[tokio::test]
    async fn test_failed_query_is_absent() {
        let root = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(None);
        let controller = x11_controller(&root, runner.clone());

        assert_eq!(controller.display_modes().await, None);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_wayland_session_is_a_no_op() {
        let root = TempDir::new().unwrap();
        let xauth = root.path().join("Xauthority");
        std::fs::write(&xauth, "cookie").unwrap();
        write_process(
            root.path(),
            7,
            &["DISPLAY=:0", &format!("XAUTHORITY={}", xauth.display()), "XDG_SESSION_TYPE=wayland"],
        );
        let runner = ScriptedRunner::new(Some(QUERY_OUTPUT));
        let options = DisplayOptions {
            proc_root: root.path().to_path_buf(),
            ..DisplayOptions::default()
        };
        let controller = DisplayController::new(&options, current_uid(), runner.clone());

        assert_eq!(controller.session().await.kind, SessionKind::Wayland);
        assert_eq!(controller.display_modes().await, None);
        controller.set_resolution(1920, 1080).await;
        assert!(runner.calls().is_empty());
    }
}
