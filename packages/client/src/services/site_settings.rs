//! Site-wide settings pushed by the server.

use tokio::sync::watch;

use parlor_shared::models::SiteSettings;
use parlor_shared::protocol::server_events;

use crate::scope::Scope;
use crate::services::socket::SocketService;

/// Holds the current [`SiteSettings`], updated from the
/// `receiveSiteSettings` push event. Settings default to the most
/// restrictive values until the server says otherwise.
#[derive(Clone)]
pub struct SiteSettingsService {
    tx: std::sync::Arc<watch::Sender<SiteSettings>>,
}

impl SiteSettingsService {
    pub fn new(scope: &Scope, socket: SocketService) -> Self {
        let (tx, _) = watch::channel(SiteSettings::default());
        let service = Self {
            tx: std::sync::Arc::new(tx),
        };

        let listener = service.clone();
        let listener_scope = scope.clone();
        tokio::spawn(async move {
            let handler_service = listener.clone();
            socket
                .for_each_event(
                    listener_scope,
                    server_events::RECEIVE_SITE_SETTINGS,
                    move |event| {
                        let service = handler_service.clone();
                        async move {
                            let Some(raw) = event.args.into_iter().next() else {
                                tracing::warn!("Site settings event carried no payload");
                                return;
                            };
                            match serde_json::from_value::<SiteSettings>(raw) {
                                Ok(settings) => service.apply(settings),
                                Err(e) => {
                                    tracing::warn!("Could not parse site settings: {}", e);
                                }
                            }
                        }
                    },
                )
                .await;
        });

        service
    }

    /// Service with no socket listener attached. Settings only change via
    /// [`apply`](Self::apply); used by tests.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, _) = watch::channel(SiteSettings::default());
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    pub(crate) fn apply(&self, settings: SiteSettings) {
        tracing::debug!(?settings, "Site settings updated");
        self.tx.send_replace(settings);
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> SiteSettings {
        self.tx.borrow().clone()
    }

    /// Watch of settings changes.
    pub fn settings_watch(&self) -> watch::Receiver<SiteSettings> {
        self.tx.subscribe()
    }
}
