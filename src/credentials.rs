use async_trait::async_trait;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("{program} CLI not found. Install with: brew install {program}")]
    NotInstalled { program: String },
    #[error("{command} timed out")]
    TimedOut { command: String },
    #[error("{command} failed: {stderr}")]
    Failed { command: String, stderr: String },
    #[error("Empty token from {command}")]
    EmptyToken { command: String },
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Something that can mint a fresh upstream bearer token.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn mint(&self) -> Result<String, CredentialError>;
}

/// Runs a local CLI (by default `gh auth token`) and reads the token from stdout.
pub struct CommandCredentialSource {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandCredentialSource {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl CredentialSource for CommandCredentialSource {
    async fn mint(&self) -> Result<String, CredentialError> {
        let command = self.display();
        let child = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.timeout, child).await {
            Err(_) => return Err(CredentialError::TimedOut { command }),
            Ok(Err(err)) if err.kind() == ErrorKind::NotFound => {
                return Err(CredentialError::NotInstalled {
                    program: self.program.clone(),
                });
            }
            Ok(Err(source)) => return Err(CredentialError::Spawn { command, source }),
            Ok(Ok(output)) => output,
        };
        if !output.status.success() {
            return Err(CredentialError::Failed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(CredentialError::EmptyToken { command });
        }
        Ok(token)
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Process-local token cache with a fixed TTL.
///
/// The lock is held across check-and-refresh, so concurrent cache misses
/// result in a single call to the underlying source.
#[derive(Clone)]
pub struct CredentialCache {
    source: Arc<dyn CredentialSource>,
    ttl: Duration,
    slot: Arc<Mutex<Option<CachedToken>>>,
}

impl CredentialCache {
    pub fn new(source: Arc<dyn CredentialSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn get_token(&self) -> Result<String, CredentialError> {
        let mut guard = self.slot.lock().await;
        if let Some(cached) = guard.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.value.clone());
            }
        }
        match self.source.mint().await {
            Ok(value) => {
                metrics::counter!("gateway_credential_refresh_total", "outcome" => "ok")
                    .increment(1);
                tracing::debug!(ttl_secs = self.ttl.as_secs(), "upstream credential refreshed");
                *guard = Some(CachedToken {
                    value: value.clone(),
                    expires_at: Instant::now() + self.ttl,
                });
                Ok(value)
            }
            Err(err) => {
                metrics::counter!("gateway_credential_refresh_total", "outcome" => "error")
                    .increment(1);
                tracing::warn!("credential refresh failed: {err}");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandCredentialSource, CredentialCache, CredentialError, CredentialSource};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn mint(&self) -> Result<String, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(CredentialError::EmptyToken {
                    command: "fake".to_string(),
                });
            }
            Ok(format!("token-{n}"))
        }
    }

    fn counting(fail: bool) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn second_call_within_ttl_hits_cache() {
        let source = counting(false);
        let cache = CredentialCache::new(source.clone(), Duration::from_secs(300));
        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_token_is_refetched() {
        let source = counting(false);
        let cache = CredentialCache::new(source.clone(), Duration::from_millis(50));
        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.get_token().await.unwrap(), "token-2");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_mint_once() {
        let source = counting(false);
        let cache = CredentialCache::new(source.clone(), Duration::from_secs(300));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_token().await.unwrap() })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "token-1");
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let source = counting(true);
        let cache = CredentialCache::new(source.clone(), Duration::from_secs(300));
        assert!(cache.get_token().await.is_err());
        assert!(cache.get_token().await.is_err());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_program_reports_not_installed() {
        let source = CommandCredentialSource::new(
            "copilot-gateway-definitely-missing-cli",
            vec!["auth".to_string(), "token".to_string()],
            Duration::from_secs(10),
        );
        let err = source.mint().await.unwrap_err();
        assert!(matches!(err, CredentialError::NotInstalled { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[cfg(unix)]
    mod unix {
        use super::super::{CommandCredentialSource, CredentialError, CredentialSource};
        use std::time::Duration;

        fn sh(script: &str) -> CommandCredentialSource {
            CommandCredentialSource::new(
                "sh",
                vec!["-c".to_string(), script.to_string()],
                Duration::from_secs(10),
            )
        }

        #[tokio::test]
        async fn stdout_is_trimmed_into_token() {
            let token = sh("printf '  gho_abc123\\n'").mint().await.unwrap();
            assert_eq!(token, "gho_abc123");
        }

        #[tokio::test]
        async fn non_zero_exit_carries_stderr() {
            let err = sh("echo 'not logged in' >&2; exit 4").mint().await.unwrap_err();
            match err {
                CredentialError::Failed { stderr, .. } => assert_eq!(stderr, "not logged in"),
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn blank_stdout_is_empty_token() {
            let err = sh("echo '   '").mint().await.unwrap_err();
            assert!(matches!(err, CredentialError::EmptyToken { .. }));
        }

        #[tokio::test]
        async fn slow_command_times_out() {
            let source = CommandCredentialSource::new(
                "sh",
                vec!["-c".to_string(), "sleep 5".to_string()],
                Duration::from_millis(100),
            );
            let err = source.mint().await.unwrap_err();
            assert!(matches!(err, CredentialError::TimedOut { .. }));
        }
    }
}
