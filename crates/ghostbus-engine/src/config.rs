use std::path::PathBuf;

/// Default directory for the engine's rendezvous files and sockets.
pub const DEFAULT_RUNTIME_DIR: &str = "/tmp/ghostbus";

/// Filesystem endpoints used by the engine, resolved once at init.
///
/// Everything lives under one runtime directory by default so an engine
/// and its model agree on the rendezvous layout by agreeing on a single
/// path. Each endpoint can still be pinned individually through the
/// environment, which is how test fixtures isolate themselves:
///
/// - `GHOSTBUS_RUNTIME_DIR` — base directory (default `/tmp/ghostbus`)
/// - `GHOSTBUS_MODEL_SOCKET` — the model's listening socket the engine
///   connects to for every request
/// - `GHOSTBUS_INTR_SOCKET` — the engine's listening socket for the
///   synchronous interrupt path
/// - `GHOSTBUS_PID_FILE` — where the engine advertises its PID
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub runtime_dir: PathBuf,
    pub model_socket: PathBuf,
    pub intr_socket: PathBuf,
    pub pid_file: PathBuf,
}

impl EngineConfig {
    /// Resolve the configuration from the environment.
    pub fn from_env() -> Self {
        let runtime_dir = std::env::var_os("GHOSTBUS_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_DIR));
        Self::in_dir(runtime_dir)
    }

    /// Configuration rooted at `runtime_dir`, with per-endpoint
    /// environment overrides still honored.
    pub fn in_dir(runtime_dir: impl Into<PathBuf>) -> Self {
        let runtime_dir = runtime_dir.into();
        let endpoint = |var: &str, file: &str| {
            std::env::var_os(var)
                .map(PathBuf::from)
                .unwrap_or_else(|| runtime_dir.join(file))
        };
        Self {
            model_socket: endpoint("GHOSTBUS_MODEL_SOCKET", "model.sock"),
            intr_socket: endpoint("GHOSTBUS_INTR_SOCKET", "intr.sock"),
            pid_file: endpoint("GHOSTBUS_PID_FILE", "engine.pid"),
            runtime_dir,
        }
    }

    /// Interrupt parameter drop file for the process `pid`. Named after
    /// the reader so the file is single-reader single-writer by
    /// construction.
    pub fn drop_file(&self, pid: u32) -> PathBuf {
        self.runtime_dir.join(format!("intr-{pid}.msg"))
    }
}
