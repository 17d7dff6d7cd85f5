//! Materializing the tunnel server binary inside a sandbox.
//!
//! Either the binary already ships in the sandbox image
//! ([`TunnelPayload::Installed`]) or its bytes are uploaded through the exec
//! primitive as base64 chunks, verified with `sha256sum`, and moved into
//! place. An upload is skipped when the remote file already has the
//! expected digest.

use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use sprites_proxy_core::{ProxyError, ProxyResult};
use tracing::{debug, info};

use crate::exec::{shell_quote, CommandOutput, RemoteExec};

/// File name of the uploaded server inside the install directory.
pub const SERVER_BINARY_NAME: &str = "sprites-tcp-proxy";

/// Printed by generated scripts when a required tool is missing.
pub(crate) const UNSUPPORTED_MARKER: &str = "sprites-proxy:unsupported:";

/// Base64 characters per upload command, well under `MAX_ARG_STRLEN`.
const UPLOAD_CHUNK: usize = 48 * 1024;

/// Where the tunnel server binary comes from.
#[derive(Debug, Clone)]
pub enum TunnelPayload {
    /// Already present in the sandbox at `path`.
    Installed { path: String },
    /// Uploaded into the install directory before launch.
    Binary { bytes: Arc<Vec<u8>> },
}

impl TunnelPayload {
    pub fn installed(path: impl Into<String>) -> Self {
        TunnelPayload::Installed { path: path.into() }
    }

    pub fn binary(bytes: Vec<u8>) -> Self {
        TunnelPayload::Binary {
            bytes: Arc::new(bytes),
        }
    }

    /// Read a local server binary for upload.
    pub fn from_file(path: &Path) -> ProxyResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            ProxyError::Config(format!("cannot read payload {}: {e}", path.display()))
        })?;
        Ok(Self::binary(bytes))
    }

    /// Path of the server binary inside the sandbox.
    pub fn remote_path(&self, install_dir: &str) -> String {
        match self {
            TunnelPayload::Installed { path } => path.clone(),
            TunnelPayload::Binary { .. } => {
                format!("{}/{SERVER_BINARY_NAME}", install_dir.trim_end_matches('/'))
            }
        }
    }

    /// Hex SHA-256 of an uploadable payload.
    pub fn digest(&self) -> Option<String> {
        match self {
            TunnelPayload::Installed { .. } => None,
            TunnelPayload::Binary { bytes } => Some(hex::encode(Sha256::digest(bytes.as_slice()))),
        }
    }
}

/// Shell snippet failing with [`UNSUPPORTED_MARKER`] when `tool` is absent.
pub(crate) fn require_tool(tool: &str) -> String {
    format!("command -v {tool} >/dev/null 2>&1 || {{ echo '{UNSUPPORTED_MARKER} {tool}'; exit 3; }}")
}

/// Whether a command failed because the sandbox lacks a capability.
pub(crate) fn unsupported_reason(output: &CommandOutput) -> Option<String> {
    if let Some(line) = output
        .stdout
        .lines()
        .find(|l| l.starts_with(UNSUPPORTED_MARKER))
    {
        let what = line[UNSUPPORTED_MARKER.len()..].trim();
        return Some(format!("required capability missing in sandbox: {what}"));
    }
    match output.exit_code {
        Some(126) => Some("tunnel server binary cannot execute in sandbox".into()),
        Some(127) => Some("command interpreter or tool not found in sandbox".into()),
        _ => None,
    }
}

/// Run a generated script, mapping capability failures to `Unsupported`.
pub(crate) async fn run_script<E: RemoteExec>(exec: &E, script: &str) -> ProxyResult<CommandOutput> {
    let output = exec.exec(script).await?;
    if let Some(reason) = unsupported_reason(&output) {
        return Err(ProxyError::Unsupported(reason));
    }
    Ok(output)
}

fn start_failed(step: &str, output: &CommandOutput) -> ProxyError {
    let detail = output.stderr.trim();
    ProxyError::StartFailed {
        exit_code: output.exit_code,
        detail: if detail.is_empty() {
            step.to_string()
        } else {
            format!("{step}: {detail}")
        },
    }
}

fn digest_script(remote_path: &str) -> String {
    let path = shell_quote(remote_path);
    format!(
        "{}\n{}\nif [ -f {path} ]; then sha256sum {path} | cut -d ' ' -f 1; fi",
        require_tool("sha256sum"),
        require_tool("base64"),
    )
}

fn upload_scripts(remote_path: &str, bytes: &[u8], digest: &str) -> Vec<String> {
    let path = shell_quote(remote_path);
    let staged = shell_quote(&format!("{remote_path}.b64"));
    let part = shell_quote(&format!("{remote_path}.part"));
    let dir = shell_quote(
        Path::new(remote_path)
            .parent()
            .and_then(Path::to_str)
            .filter(|d| !d.is_empty())
            .unwrap_or("."),
    );

    let encoded = BASE64.encode(bytes);
    let mut scripts = vec![format!("mkdir -p {dir} && rm -f {staged} && : > {staged}")];
    for chunk in encoded.as_bytes().chunks(UPLOAD_CHUNK) {
        // Base64 output is ASCII, so any byte boundary is a char boundary.
        let chunk = String::from_utf8_lossy(chunk);
        scripts.push(format!("printf '%s' '{chunk}' >> {staged}"));
    }
    scripts.push(format!(
        "base64 -d {staged} > {part} && rm -f {staged} && \
         [ \"$(sha256sum {part} | cut -d ' ' -f 1)\" = '{digest}' ] || \
         {{ echo 'payload digest mismatch' >&2; rm -f {part}; exit 1; }}\n\
         chmod 755 {part} && mv -f {part} {path}"
    ));
    scripts
}

/// Make sure the server binary exists in the sandbox. Returns its path.
pub async fn materialize<E: RemoteExec>(
    exec: &E,
    payload: &TunnelPayload,
    install_dir: &str,
) -> ProxyResult<String> {
    let remote_path = payload.remote_path(install_dir);
    let TunnelPayload::Binary { bytes } = payload else {
        return Ok(remote_path);
    };
    let digest = payload.digest().unwrap_or_default();

    let output = run_script(exec, &digest_script(&remote_path)).await?;
    if !output.success() {
        return Err(start_failed("payload digest check failed", &output));
    }
    if output.stdout.lines().last().map(str::trim) == Some(digest.as_str()) {
        debug!(path = %remote_path, "payload already present");
        return Ok(remote_path);
    }

    let scripts = upload_scripts(&remote_path, bytes, &digest);
    info!(path = %remote_path, bytes = bytes.len(), commands = scripts.len(), "uploading tunnel server");
    for script in &scripts {
        let output = run_script(exec, script).await?;
        if !output.success() {
            return Err(start_failed("payload upload failed", &output));
        }
    }
    Ok(remote_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records commands and answers from a script of canned outputs.
    struct ScriptedExec {
        commands: Mutex<Vec<String>>,
        outputs: Mutex<Vec<CommandOutput>>,
    }

    impl ScriptedExec {
        fn new(outputs: Vec<CommandOutput>) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                outputs: Mutex::new(outputs),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl RemoteExec for ScriptedExec {
        async fn exec(&self, command: &str) -> ProxyResult<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            let mut outputs = self.outputs.lock().unwrap();
            Ok(if outputs.is_empty() {
                ok("")
            } else {
                outputs.remove(0)
            })
        }
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    #[test]
    fn remote_paths() {
        assert_eq!(
            TunnelPayload::installed("/usr/bin/sprites-tcp-proxy").remote_path("/tmp/x"),
            "/usr/bin/sprites-tcp-proxy"
        );
        assert_eq!(
            TunnelPayload::binary(vec![1]).remote_path("/tmp/x/"),
            "/tmp/x/sprites-tcp-proxy"
        );
    }

    #[test]
    fn digest_is_sha256_hex() {
        let payload = TunnelPayload::binary(b"abc".to_vec());
        assert_eq!(
            payload.digest().unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(TunnelPayload::installed("/bin/x").digest().is_none());
    }

    #[test]
    fn upload_is_chunked() {
        let bytes = vec![0xAB; UPLOAD_CHUNK * 2];
        let scripts = upload_scripts("/tmp/p/sprites-tcp-proxy", &bytes, "d");
        // mkdir, ceil(4/3 * 2 * chunk / chunk) = 3 chunks, finalize
        assert_eq!(scripts.len(), 5);
        assert!(scripts[0].starts_with("mkdir -p '/tmp/p'"));
        assert!(scripts.last().unwrap().contains("mv -f"));
    }

    #[test]
    fn unsupported_detection() {
        let missing = CommandOutput {
            stdout: format!("{UNSUPPORTED_MARKER} base64\n"),
            stderr: String::new(),
            exit_code: Some(3),
        };
        assert!(unsupported_reason(&missing).unwrap().contains("base64"));

        let not_found = CommandOutput {
            exit_code: Some(127),
            ..Default::default()
        };
        assert!(unsupported_reason(&not_found).is_some());
        assert!(unsupported_reason(&ok("fine")).is_none());
    }

    #[tokio::test]
    async fn installed_payload_runs_nothing() {
        let exec = ScriptedExec::new(vec![]);
        let path = materialize(&exec, &TunnelPayload::installed("/opt/bin/p"), "/tmp/x")
            .await
            .unwrap();
        assert_eq!(path, "/opt/bin/p");
        assert!(exec.commands().is_empty());
    }

    #[tokio::test]
    async fn matching_digest_skips_upload() {
        let payload = TunnelPayload::binary(b"abc".to_vec());
        let exec = ScriptedExec::new(vec![ok(&format!("{}\n", payload.digest().unwrap()))]);
        materialize(&exec, &payload, "/tmp/x").await.unwrap();
        assert_eq!(exec.commands().len(), 1);
    }

    #[tokio::test]
    async fn upload_when_absent() {
        let payload = TunnelPayload::binary(b"abc".to_vec());
        let exec = ScriptedExec::new(vec![ok("")]);
        materialize(&exec, &payload, "/tmp/x").await.unwrap();
        let commands = exec.commands();
        assert_eq!(commands.len(), 4);
        assert!(commands[2].contains(&BASE64.encode(b"abc")));
    }

    #[tokio::test]
    async fn missing_tool_is_unsupported() {
        let payload = TunnelPayload::binary(b"abc".to_vec());
        let exec = ScriptedExec::new(vec![CommandOutput {
            stdout: format!("{UNSUPPORTED_MARKER} sha256sum\n"),
            stderr: String::new(),
            exit_code: Some(3),
        }]);
        let err = materialize(&exec, &payload, "/tmp/x").await.unwrap_err();
        assert_eq!(err.code(), "unsupported");
    }

    #[tokio::test]
    async fn failed_upload_is_start_failed() {
        let payload = TunnelPayload::binary(b"abc".to_vec());
        let exec = ScriptedExec::new(vec![
            ok(""),
            CommandOutput {
                stdout: String::new(),
                stderr: "No space left on device\n".into(),
                exit_code: Some(1),
            },
        ]);
        let err = materialize(&exec, &payload, "/tmp/x").await.unwrap_err();
        assert_eq!(err.code(), "start_failed");
        assert!(err.to_string().contains("No space left"), "{err}");
    }

    #[tokio::test]
    async fn real_upload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let install_dir = dir.path().join("install");
        let install_dir = install_dir.to_str().unwrap();
        let bytes: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let payload = TunnelPayload::binary(bytes.clone());

        let shell = crate::exec::LocalShell;
        let probe = shell.exec("command -v base64 && command -v sha256sum").await.unwrap();
        if !probe.success() {
            return;
        }

        let path = materialize(&shell, &payload, install_dir).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
        // Second run finds the digest and uploads nothing.
        assert_eq!(materialize(&shell, &payload, install_dir).await.unwrap(), path);
    }
}
