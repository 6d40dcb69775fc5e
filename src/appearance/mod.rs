//! Appearance settings, their shareable code, and the visual state derived from them.

mod store;

pub use store::{SettingsStore, APPEARANCE_KEY};

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    model::{Profile, ProfilePatch},
    DecodeError,
};

pub const DEFAULT_PRIMARY_COLOR: &str = "#0066FF";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BubbleStyle {
    #[default]
    Modern,
    Rounded,
    #[serde(alias = "square")]
    Classic,
    Minimal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    Left,
    #[default]
    Right,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

impl BubbleStyle {
    pub fn as_str(&self) -> &'static str {
        use BubbleStyle::*;
        match self {
            Modern => "modern",
            Rounded => "rounded",
            Classic => "classic",
            Minimal => "minimal",
        }
    }

    pub fn border_radius(&self) -> &'static str {
        use BubbleStyle::*;
        match self {
            Modern => "1rem",
            Rounded => "1.5rem",
            Classic => "0.5rem",
            Minimal => "0.25rem",
        }
    }
}

impl Alignment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Alignment::Left => "left",
            Alignment::Right => "right",
        }
    }
}

/// `#RGB` or `#RRGGBB`, case preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexColor(String);

impl HexColor {
    pub fn parse(value: &str) -> Result<Self, DecodeError> {
        let digits = value
            .strip_prefix('#')
            .filter(|d| matches!(d.len(), 3 | 6) && d.chars().all(|c| c.is_ascii_hexdigit()));
        match digits {
            Some(_) => Ok(Self(value.to_owned())),
            None => Err(DecodeError::InvalidColor(value.to_owned())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for HexColor {
    fn default() -> Self {
        Self(DEFAULT_PRIMARY_COLOR.to_owned())
    }
}

impl TryFrom<String> for HexColor {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HexColor> for String {
    fn from(color: HexColor) -> Self {
        color.0
    }
}

impl fmt::Display for HexColor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn enabled() -> bool {
    true
}

/// Every field has a default; a partial object read from storage merges over them.
/// camelCase keys written by older clients are accepted on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppearanceSettings {
    pub theme: Theme,
    #[serde(alias = "bubbleStyle")]
    pub bubble_style: BubbleStyle,
    #[serde(alias = "primaryColor")]
    pub primary_color: HexColor,
    #[serde(alias = "messageAlignment")]
    pub message_alignment: Alignment,
    #[serde(alias = "enableSounds")]
    pub enable_sounds: bool,
    #[serde(alias = "showTimestamps")]
    pub show_timestamps: bool,
    #[serde(alias = "showReadReceipts")]
    pub show_read_receipts: bool,
    #[serde(alias = "enableNotifications")]
    pub enable_notifications: bool,
}

impl Default for AppearanceSettings {
    fn default() -> Self {
        Self {
            theme: Theme::Light,
            bubble_style: BubbleStyle::Modern,
            primary_color: HexColor::default(),
            message_alignment: Alignment::Right,
            enable_sounds: true,
            show_timestamps: true,
            show_read_receipts: true,
            enable_notifications: true,
        }
    }
}

/// A shared code: the four visual fields are required, toggles are optional.
#[derive(Deserialize)]
struct CodePayload {
    theme: Theme,
    #[serde(alias = "bubbleStyle")]
    bubble_style: BubbleStyle,
    #[serde(alias = "primaryColor")]
    primary_color: HexColor,
    #[serde(alias = "messageAlignment")]
    message_alignment: Alignment,
    #[serde(default = "enabled", alias = "enableSounds")]
    enable_sounds: bool,
    #[serde(default = "enabled", alias = "showTimestamps")]
    show_timestamps: bool,
    #[serde(default = "enabled", alias = "showReadReceipts")]
    show_read_receipts: bool,
    #[serde(default = "enabled", alias = "enableNotifications")]
    enable_notifications: bool,
}

impl From<CodePayload> for AppearanceSettings {
    fn from(code: CodePayload) -> Self {
        Self {
            theme: code.theme,
            bubble_style: code.bubble_style,
            primary_color: code.primary_color,
            message_alignment: code.message_alignment,
            enable_sounds: code.enable_sounds,
            show_timestamps: code.show_timestamps,
            show_read_receipts: code.show_read_receipts,
            enable_notifications: code.enable_notifications,
        }
    }
}

/// Base64 of the settings' JSON. Same settings, same code.
pub fn encode(settings: &AppearanceSettings) -> String {
    // a struct of enums, strings and bools always serializes
    let json = serde_json::to_vec(settings).unwrap_or_default();
    STANDARD.encode(json)
}

pub fn decode(code: &str) -> Result<AppearanceSettings, DecodeError> {
    let bytes = STANDARD.decode(code.trim())?;
    let json = String::from_utf8(bytes)?;
    let payload: CodePayload = serde_json::from_str(&json)?;
    Ok(payload.into())
}

/// Fields present in the patch replace the current ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AppearancePatch {
    pub theme: Option<Theme>,
    #[serde(alias = "bubbleStyle")]
    pub bubble_style: Option<BubbleStyle>,
    #[serde(alias = "primaryColor")]
    pub primary_color: Option<HexColor>,
    #[serde(alias = "messageAlignment")]
    pub message_alignment: Option<Alignment>,
    #[serde(alias = "enableSounds")]
    pub enable_sounds: Option<bool>,
    #[serde(alias = "showTimestamps")]
    pub show_timestamps: Option<bool>,
    #[serde(alias = "showReadReceipts")]
    pub show_read_receipts: Option<bool>,
    #[serde(alias = "enableNotifications")]
    pub enable_notifications: Option<bool>,
}

fn parse_column<T: DeserializeOwned>(column: &Option<String>) -> Option<T> {
    let value = column.as_ref()?;
    serde_json::from_value(serde_json::Value::String(value.clone())).ok()
}

impl AppearanceSettings {
    pub fn merged(mut self, patch: AppearancePatch) -> Self {
        if let Some(theme) = patch.theme {
            self.theme = theme;
        }
        if let Some(bubble_style) = patch.bubble_style {
            self.bubble_style = bubble_style;
        }
        if let Some(primary_color) = patch.primary_color {
            self.primary_color = primary_color;
        }
        if let Some(message_alignment) = patch.message_alignment {
            self.message_alignment = message_alignment;
        }
        self.enable_sounds = patch.enable_sounds.unwrap_or(self.enable_sounds);
        self.show_timestamps = patch.show_timestamps.unwrap_or(self.show_timestamps);
        self.show_read_receipts = patch.show_read_receipts.unwrap_or(self.show_read_receipts);
        self.enable_notifications = patch.enable_notifications.unwrap_or(self.enable_notifications);
        self
    }

    /// Reads the appearance columns of a profile; null or unreadable columns take defaults.
    pub fn from_profile(profile: &Profile) -> Self {
        let defaults = Self::default();
        Self {
            theme: parse_column(&profile.theme).unwrap_or(defaults.theme),
            bubble_style: parse_column(&profile.bubble_style).unwrap_or(defaults.bubble_style),
            primary_color: parse_column(&profile.primary_color).unwrap_or(defaults.primary_color),
            message_alignment: parse_column(&profile.message_alignment)
                .unwrap_or(defaults.message_alignment),
            enable_sounds: profile.enable_sounds.unwrap_or(defaults.enable_sounds),
            show_timestamps: profile.show_timestamps.unwrap_or(defaults.show_timestamps),
            show_read_receipts: profile.show_read_receipts.unwrap_or(defaults.show_read_receipts),
            enable_notifications: profile
                .enable_notifications
                .unwrap_or(defaults.enable_notifications),
        }
    }

    pub fn to_profile_patch(&self) -> ProfilePatch {
        ProfilePatch {
            theme: Some(self.theme.as_str().to_owned()),
            bubble_style: Some(self.bubble_style.as_str().to_owned()),
            primary_color: Some(self.primary_color.to_string()),
            message_alignment: Some(self.message_alignment.as_str().to_owned()),
            enable_sounds: Some(self.enable_sounds),
            show_timestamps: Some(self.show_timestamps),
            show_read_receipts: Some(self.show_read_receipts),
            enable_notifications: Some(self.enable_notifications),
            ..Default::default()
        }
    }
}

/// What the root of the rendered document looks like under some settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisualState {
    pub dark: bool,
    pub primary_color: String,
    pub bubble_style: BubbleStyle,
    pub message_align: Alignment,
}

impl VisualState {
    pub fn css_variables(&self) -> Vec<(&'static str, String)> {
        vec![("--primary-color", self.primary_color.clone())]
    }

    pub fn data_attributes(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("data-bubble-style", self.bubble_style.as_str()),
            ("data-message-align", self.message_align.as_str()),
        ]
    }
}

impl From<&AppearanceSettings> for VisualState {
    fn from(settings: &AppearanceSettings) -> Self {
        Self {
            dark: settings.theme == Theme::Dark,
            primary_color: settings.primary_color.to_string(),
            bubble_style: settings.bubble_style,
            message_align: settings.message_alignment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageStyle {
    pub border_radius: &'static str,
    pub background_color: String,
    pub color: String,
}

/// Inline style of a message bubble.
pub fn message_style(settings: &AppearanceSettings, is_own: bool) -> MessageStyle {
    let (background_color, color) = match (is_own, settings.theme) {
        (true, _) => (settings.primary_color.to_string(), "#FFFFFF".to_owned()),
        (false, Theme::Dark) => ("#374151".to_owned(), "#FFFFFF".to_owned()),
        (false, Theme::Light) => ("#F3F4F6".to_owned(), "#111827".to_owned()),
    };
    MessageStyle {
        border_radius: settings.bubble_style.border_radius(),
        background_color,
        color,
    }
}
