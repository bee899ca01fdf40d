//! Data model for the shared view.
//!
//! Property bags stay as open JSON maps because they arrive from clients and
//! model replies; everything the engine inspects itself (ids, sizes,
//! positions, enumerated canvas fields) is strongly typed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Open-ended component properties as received on the wire.
pub type PropertyBag = Map<String, Value>;

/// Color roles a theme may assign. Unknown roles in a patch are ignored.
pub const COLOR_ROLES: &[&str] = &[
    "primary",
    "secondary",
    "accent",
    "background",
    "surface",
    "text",
    "border",
];

/// Effect toggles a theme may carry. Unknown effects in a patch are ignored.
pub const EFFECT_FLAGS: &[&str] = &["glow", "gradient", "animation", "shadows", "blur"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentCategory {
    Atomic,
    Composite,
    Complex,
}

impl ComponentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Atomic => "atomic",
            Self::Composite => "composite",
            Self::Complex => "complex",
        }
    }
}

impl FromStr for ComponentCategory {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "atomic" => Ok(Self::Atomic),
            "composite" => Ok(Self::Composite),
            "complex" => Ok(Self::Complex),
            other => Err(format!("unknown component category `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Width and height of a component. Both are strictly positive once the
/// value has passed through [`Size::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    #[serde(alias = "w")]
    pub width: u32,
    #[serde(alias = "h")]
    pub height: u32,
}

impl Size {
    pub fn new(width: i64, height: i64) -> Option<Self> {
        if width <= 0 || height <= 0 {
            return None;
        }
        Some(Self {
            width: u32::try_from(width).ok()?,
            height: u32::try_from(height).ok()?,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub category: ComponentCategory,
    #[serde(default)]
    pub properties: PropertyBag,
    pub position: Position,
    pub size: Size,
}

impl Component {
    pub(crate) fn fresh_id() -> String {
        format!("component-{}", Uuid::new_v4().simple())
    }
}

/// Request to create a component; the model assigns id and position.
#[derive(Debug, Clone, PartialEq)]
pub struct NewComponent {
    pub kind: String,
    pub name: Option<String>,
    pub category: ComponentCategory,
    pub properties: PropertyBag,
    pub size: Size,
}

impl NewComponent {
    pub fn new(kind: impl Into<String>, category: ComponentCategory, size: Size) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            category,
            properties: PropertyBag::new(),
            size,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_properties(mut self, properties: PropertyBag) -> Self {
        self.properties = properties;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeState {
    pub id: String,
    pub name: String,
    pub colors: BTreeMap<String, String>,
    pub effects: BTreeMap<String, bool>,
}

impl Default for ThemeState {
    fn default() -> Self {
        let colors = [
            ("primary", "#3b82f6"),
            ("secondary", "#64748b"),
            ("accent", "#f59e0b"),
            ("background", "#0f172a"),
            ("surface", "#1e293b"),
            ("text", "#f8fafc"),
            ("border", "#334155"),
        ]
        .into_iter()
        .map(|(role, color)| (role.to_string(), color.to_string()))
        .collect();
        let effects = [("glow", false), ("gradient", false), ("animation", true)]
            .into_iter()
            .map(|(flag, on)| (flag.to_string(), on))
            .collect();

        Self {
            id: "default".to_string(),
            name: "Default".to_string(),
            colors,
            effects,
        }
    }
}

/// Partial theme update. Roles and flags outside the known sets are dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThemePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub colors: BTreeMap<String, String>,
    #[serde(default)]
    pub effects: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutState {
    pub columns: u32,
    pub row_height: u32,
    pub margin: [u32; 2],
    pub container_padding: [u32; 2],
    pub show_grid: bool,
    pub snap_to_grid: bool,
}

impl Default for LayoutState {
    fn default() -> Self {
        Self {
            columns: 12,
            row_height: 30,
            margin: [10, 10],
            container_padding: [10, 10],
            show_grid: true,
            snap_to_grid: true,
        }
    }
}

/// Layout fields to overwrite; absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin: Option<[u32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_padding: Option<[u32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_grid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap_to_grid: Option<bool>,
}

impl LayoutPatch {
    pub fn is_empty(&self) -> bool {
        self.columns.is_none()
            && self.row_height.is_none()
            && self.margin.is_none()
            && self.container_padding.is_none()
            && self.show_grid.is_none()
            && self.snap_to_grid.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Viewport {
    #[default]
    Desktop,
    Tablet,
    Mobile,
}

impl Viewport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Tablet => "tablet",
            Self::Mobile => "mobile",
        }
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Viewport {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(Self::Desktop),
            "tablet" => Ok(Self::Tablet),
            "mobile" => Ok(Self::Mobile),
            other => Err(format!("unknown viewport `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PanOffset {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasState {
    pub viewport: Viewport,
    pub zoom: f64,
    pub pan: PanOffset,
    /// Id of the selected component; empty when nothing is selected.
    #[serde(default)]
    pub selected: String,
}

impl Default for CanvasState {
    fn default() -> Self {
        Self {
            viewport: Viewport::Desktop,
            zoom: 1.0,
            pan: PanOffset::default(),
            selected: String::new(),
        }
    }
}

/// Canvas fields a client may adjust in one update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanvasPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan: Option<PanOffset>,
}

/// The whole shared view: components in insertion order plus theme, layout
/// and canvas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub theme: ThemeState,
    #[serde(default)]
    pub layout: LayoutState,
    #[serde(default)]
    pub canvas: CanvasState,
}

impl ViewState {
    pub fn component(&self, id: &str) -> Option<&Component> {
        self.components.iter().find(|component| component.id == id)
    }

    pub(crate) fn component_mut(&mut self, id: &str) -> Option<&mut Component> {
        self.components.iter_mut().find(|component| component.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.component(id).is_some()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.components
            .iter()
            .map(|component| component.position)
            .collect()
    }
}
