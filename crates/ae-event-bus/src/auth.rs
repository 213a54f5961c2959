//! Bus credentials and hot reload
//!
//! [`AuthResolver`] owns the current [`Auth`] behind a watch channel. Every
//! connection attempt reads the value current at that moment, so a swapped
//! credential is picked up by the next (re)connect while existing
//! connections keep running on the credential they were opened with.

use crate::error::{EventBusError, EventBusResult};
use ae_config::{AuthCredential, AuthStrategy};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Credential used when connecting to the bus
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Auth {
    pub strategy: AuthStrategy,
    pub credential: Option<AuthCredential>,
}

impl Auth {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self {
            strategy: AuthStrategy::Token,
            credential: Some(AuthCredential {
                token: Some(token.into()),
                ..Default::default()
            }),
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            strategy: AuthStrategy::Basic,
            credential: Some(AuthCredential {
                username: Some(username.into()),
                password: Some(password.into()),
                ..Default::default()
            }),
        }
    }

    pub fn token_value(&self) -> Option<&str> {
        self.credential.as_ref().and_then(|c| c.token.as_deref())
    }

    pub fn basic_values(&self) -> Option<(&str, &str)> {
        let cred = self.credential.as_ref()?;
        Some((cred.username.as_deref()?, cred.password.as_deref()?))
    }

    /// Check the credential carries what the strategy needs
    pub fn validate(&self) -> EventBusResult<()> {
        let complete = match self.strategy {
            AuthStrategy::None => true,
            AuthStrategy::Token => self.token_value().is_some(),
            AuthStrategy::Basic => self.basic_values().is_some(),
        };
        if complete {
            Ok(())
        } else {
            Err(EventBusError::InvalidConfig(format!(
                "credential file does not provide the fields required by the '{}' strategy",
                self.strategy
            )))
        }
    }
}

struct Shared {
    strategy: AuthStrategy,
    mount_dir: PathBuf,
    tx: watch::Sender<Auth>,
}

impl Shared {
    fn read(&self) -> EventBusResult<Auth> {
        let credential = AuthCredential::load(&self.mount_dir)?;
        let auth = Auth {
            strategy: self.strategy,
            credential: Some(credential),
        };
        auth.validate()?;
        Ok(auth)
    }

    fn reload(&self) -> EventBusResult<bool> {
        let auth = self.read()?;
        let changed = self.tx.send_if_modified(|current| {
            if *current == auth {
                false
            } else {
                *current = auth;
                true
            }
        });
        Ok(changed)
    }
}

/// Holds the current bus credential and reloads it when the file changes
#[derive(Clone)]
pub struct AuthResolver {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AuthResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthResolver")
            .field("strategy", &self.shared.strategy)
            .field("mount_dir", &self.shared.mount_dir)
            .finish()
    }
}

impl AuthResolver {
    /// Resolve the credential for `strategy` from `mount_dir`
    ///
    /// Strategy `none` reads nothing.
    pub fn load(strategy: AuthStrategy, mount_dir: impl Into<PathBuf>) -> EventBusResult<Self> {
        let mount_dir = mount_dir.into();
        let (tx, _) = watch::channel(Auth {
            strategy,
            credential: None,
        });
        let shared = Arc::new(Shared {
            strategy,
            mount_dir,
            tx,
        });

        if strategy != AuthStrategy::None {
            let auth = shared.read()?;
            shared.tx.send_replace(auth);
        }

        info!(strategy = %strategy, "Resolved event bus auth");
        Ok(Self { shared })
    }

    /// Resolver for a fixed credential that never reloads
    pub fn fixed(auth: Auth) -> Self {
        let (tx, _) = watch::channel(auth.clone());
        Self {
            shared: Arc::new(Shared {
                strategy: auth.strategy,
                mount_dir: PathBuf::new(),
                tx,
            }),
        }
    }

    pub fn strategy(&self) -> AuthStrategy {
        self.shared.strategy
    }

    /// Credential to use for a connection attempt made now
    pub fn current(&self) -> Auth {
        self.shared.tx.borrow().clone()
    }

    /// Observe credential swaps
    pub fn subscribe(&self) -> watch::Receiver<Auth> {
        self.shared.tx.subscribe()
    }

    /// Re-read the credential file, returning whether the value changed
    pub fn reload(&self) -> EventBusResult<bool> {
        if self.shared.strategy == AuthStrategy::None || self.shared.mount_dir.as_os_str().is_empty() {
            return Ok(false);
        }
        self.shared.reload()
    }

    /// Watch the mount directory and reload on every change
    ///
    /// Reloading stops when the returned watcher is dropped. A file that
    /// fails to load keeps the previous credential in place.
    pub fn watch(&self) -> EventBusResult<AuthWatcher> {
        let shared = Arc::clone(&self.shared);
        let path = AuthCredential::file_path(&shared.mount_dir);

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) if event.kind.is_create() || event.kind.is_modify() => {
                    match shared.reload() {
                        Ok(true) => info!("Event bus credential reloaded"),
                        Ok(false) => debug!("Event bus credential unchanged"),
                        Err(e) => error!(error = %e, "Failed to reload event bus credential"),
                    }
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Credential watcher error"),
            })
            .map_err(|e| EventBusError::Watch(e.to_string()))?;

        // Mounted secrets are replaced through symlink swaps, so watch the directory
        watcher
            .watch(&self.shared.mount_dir, RecursiveMode::NonRecursive)
            .map_err(|e| EventBusError::Watch(e.to_string()))?;

        debug!(path = %path.display(), "Watching event bus credential");
        Ok(AuthWatcher { _watcher: watcher })
    }
}

/// Keeps the credential file watch alive
pub struct AuthWatcher {
    _watcher: RecommendedWatcher,
}
