use crate::error::CredentialError;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Acquire a Kerberos ticket for `principal` by feeding `password` to the
/// ticket helper on stdin. The pipe is closed after the write so the helper
/// sees end-of-input. Returns whatever the helper printed on stdout.
pub async fn kinit(program: &str, principal: &str, password: &str) -> Result<String, CredentialError> {
    let mut child = Command::new(program)
        .arg(principal)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CredentialError::Kerberos {
            stage: "start",
            message: e.to_string(),
        })?;

    let mut stdin = child.stdin.take().ok_or_else(|| CredentialError::Kerberos {
        stage: "pipe",
        message: "stdin was not captured".into(),
    })?;
    stdin
        .write_all(password.as_bytes())
        .await
        .map_err(|e| CredentialError::Kerberos {
            stage: "write",
            message: e.to_string(),
        })?;
    stdin.shutdown().await.map_err(|e| CredentialError::Kerberos {
        stage: "close",
        message: e.to_string(),
    })?;
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| CredentialError::Kerberos {
            stage: "wait",
            message: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() {
            output.status.to_string()
        } else {
            format!("{}: {}", output.status, stderr.trim())
        };
        return Err(CredentialError::Kerberos {
            stage: "wait",
            message: detail,
        });
    }

    tracing::debug!(principal = %principal, "kinit: {}", stdout.trim());
    Ok(stdout)
}
