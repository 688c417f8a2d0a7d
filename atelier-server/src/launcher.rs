use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use atelier_core::Config;
use tracing::info;

/// Directory the external graphical node editor is expected to live in,
/// relative to the working directory.
const EDITOR_DIR: &str = "editor";

/// Launch the external node editor and block until it exits.
pub fn launch_editor(config: &Config) -> Result<()> {
    let editor_dir = Path::new(EDITOR_DIR);
    if !editor_dir.join("main.py").exists() {
        bail!(
            "node editor not found at ./{EDITOR_DIR}; clone it there first \
             (git clone <editor repository> {EDITOR_DIR})"
        );
    }

    let host = config.get("ui.host", String::from("127.0.0.1"));
    let port: u16 = config.get("ui.port", 8188);

    info!("launching node editor at http://{host}:{port}");
    let status = Command::new("python3")
        .arg("main.py")
        .args(["--listen", &host, "--port", &port.to_string()])
        .current_dir(editor_dir)
        .status()
        .context("failed to launch node editor")?;

    if !status.success() {
        bail!("node editor exited with {status}");
    }
    Ok(())
}
