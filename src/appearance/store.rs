use std::sync::Arc;

use tokio::sync::watch;

use crate::{local::LocalStorage, notify::Toasts, remote::RemoteStore, ChatError, ChatResult};

use super::{decode, encode, AppearancePatch, AppearanceSettings, VisualState};

pub const APPEARANCE_KEY: &str = "chathub_appearance";

/// The one source of truth for appearance. Hand out clones of the `Arc` (or
/// receivers from `subscribe`) instead of keeping copies of the settings.
pub struct SettingsStore {
    storage: Arc<dyn LocalStorage>,
    remote: Option<Arc<dyn RemoteStore>>,
    toasts: Toasts,
    settings: watch::Sender<AppearanceSettings>,
    visual: watch::Sender<VisualState>,
}

impl SettingsStore {
    /// Reads persisted settings, falling back to defaults when absent or
    /// corrupt, and applies them right away.
    pub fn load_or_default(storage: Arc<dyn LocalStorage>, toasts: Toasts) -> Self {
        let settings = match storage.get(APPEARANCE_KEY) {
            Some(saved) => serde_json::from_str(&saved).unwrap_or_else(|e| {
                tracing::warn!("discarding unreadable appearance settings: {e}");
                AppearanceSettings::default()
            }),
            None => AppearanceSettings::default(),
        };

        let store = Self {
            storage,
            remote: None,
            toasts,
            visual: watch::channel(VisualState::from(&settings)).0,
            settings: watch::channel(settings.clone()).0,
        };
        if let Err(e) = store.apply(settings) {
            tracing::warn!("appearance settings not persisted: {e}");
        }
        store
    }

    /// Lets signed-in users keep their appearance on their remote profile.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn settings(&self) -> AppearanceSettings {
        self.settings.borrow().clone()
    }

    pub fn visual(&self) -> VisualState {
        self.visual.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AppearanceSettings> {
        self.settings.subscribe()
    }

    pub fn watch_visual(&self) -> watch::Receiver<VisualState> {
        self.visual.subscribe()
    }

    /// Persists, then updates the visual state. Applying the same settings twice
    /// leaves the same state. A failed write changes nothing.
    pub fn apply(&self, settings: AppearanceSettings) -> ChatResult<()> {
        let json = serde_json::to_string(&settings).map_err(|e| ChatError::Storage(e.into()))?;
        self.storage.set(APPEARANCE_KEY, &json)?;

        self.visual.send_replace(VisualState::from(&settings));
        self.settings.send_replace(settings);
        Ok(())
    }

    pub fn update(&self, patch: AppearancePatch) -> ChatResult<AppearanceSettings> {
        let settings = self.settings().merged(patch);
        self.apply(settings.clone())?;
        Ok(settings)
    }

    pub fn share_code(&self) -> String {
        encode(&self.settings.borrow())
    }

    /// Decodes and applies a shared code. On a bad code the current settings stay.
    pub fn apply_code(&self, code: &str) -> ChatResult<AppearanceSettings> {
        let settings = match decode(code) {
            Ok(settings) => settings,
            Err(e) => {
                self.toasts.error("Invalid appearance code", &e);
                return Err(e.into());
            }
        };
        self.apply(settings.clone())?;
        self.toasts.success("Appearance settings applied successfully!");
        Ok(settings)
    }

    /// Writes the current settings to the signed-in user's profile.
    pub async fn save_to_profile(&self) -> ChatResult<()> {
        let Some(remote) = &self.remote else {
            return Ok(());
        };
        let user = remote.current_user().await.ok_or(ChatError::NotSignedIn)?;
        let patch = self.settings().to_profile_patch();
        match remote.update_profile(&user.user_id, &patch).await {
            Ok(()) => {
                self.toasts.success("Profile updated successfully");
                Ok(())
            }
            Err(e) => {
                self.toasts.error("Failed to update profile", &e);
                Err(e)
            }
        }
    }

    /// Replaces the local settings with the ones stored on the profile.
    pub async fn sync_from_profile(&self) -> ChatResult<AppearanceSettings> {
        let Some(remote) = &self.remote else {
            return Ok(self.settings());
        };
        let user = remote.current_user().await.ok_or(ChatError::NotSignedIn)?;
        let profile = match remote.fetch_profile(&user.user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => return Ok(self.settings()),
            Err(e) => {
                self.toasts.error("Failed to load profile", &e);
                return Err(e);
            }
        };
        let settings = AppearanceSettings::from_profile(&profile);
        self.apply(settings.clone())?;
        Ok(settings)
    }
}
