//! Shape checks for mutation directives.
//!
//! Payloads are decoded into typed structs here; nothing downstream ever
//! looks at the raw JSON again. Any missing or mistyped field fails the
//! whole directive.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::state::{
    CanvasPatch, ComponentCategory, LayoutPatch, Mutation, NewComponent, PropertyBag, Size,
    ThemePatch, Viewport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectiveAction {
    AddComponent,
    UpdateComponent,
    ReplaceTheme,
    UpdateLayout,
    RemoveComponent,
    SelectComponent,
    SetViewport,
    UpdateCanvas,
}

impl DirectiveAction {
    /// Actions the language model is allowed to issue.
    pub const MODEL_ACTIONS: [DirectiveAction; 4] = [
        Self::AddComponent,
        Self::UpdateComponent,
        Self::ReplaceTheme,
        Self::UpdateLayout,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "add_component" => Some(Self::AddComponent),
            "update_component" => Some(Self::UpdateComponent),
            "replace_theme" => Some(Self::ReplaceTheme),
            "update_layout" => Some(Self::UpdateLayout),
            "remove_component" => Some(Self::RemoveComponent),
            "select_component" => Some(Self::SelectComponent),
            "set_viewport" => Some(Self::SetViewport),
            "update_canvas" => Some(Self::UpdateCanvas),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddComponent => "add_component",
            Self::UpdateComponent => "update_component",
            Self::ReplaceTheme => "replace_theme",
            Self::UpdateLayout => "update_layout",
            Self::RemoveComponent => "remove_component",
            Self::SelectComponent => "select_component",
            Self::SetViewport => "set_viewport",
            Self::UpdateCanvas => "update_canvas",
        }
    }

    pub fn is_model_action(&self) -> bool {
        Self::MODEL_ACTIONS.contains(self)
    }
}

impl fmt::Display for DirectiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DirectiveError {
    #[error("directive is not a JSON object")]
    NotAnObject,

    #[error("directive has no `action` string")]
    MissingAction,

    #[error("unrecognized action `{0}`")]
    UnknownAction(String),

    #[error("action `{0}` cannot be issued by the model")]
    NotPermitted(DirectiveAction),

    #[error("directive has no `data` object")]
    MissingData,

    #[error("malformed `{action}` payload: {reason}")]
    MalformedPayload {
        action: DirectiveAction,
        reason: String,
    },
}

/// A validated mutation request.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    AddComponent(NewComponent),
    UpdateComponent { id: String, properties: PropertyBag },
    ReplaceTheme(ThemePatch),
    UpdateLayout(LayoutPatch),
    RemoveComponent { id: String },
    SelectComponent { id: String },
    SetViewport { viewport: Viewport },
    UpdateCanvas(CanvasPatch),
}

impl Directive {
    pub fn action(&self) -> DirectiveAction {
        match self {
            Self::AddComponent(_) => DirectiveAction::AddComponent,
            Self::UpdateComponent { .. } => DirectiveAction::UpdateComponent,
            Self::ReplaceTheme(_) => DirectiveAction::ReplaceTheme,
            Self::UpdateLayout(_) => DirectiveAction::UpdateLayout,
            Self::RemoveComponent { .. } => DirectiveAction::RemoveComponent,
            Self::SelectComponent { .. } => DirectiveAction::SelectComponent,
            Self::SetViewport { .. } => DirectiveAction::SetViewport,
            Self::UpdateCanvas(_) => DirectiveAction::UpdateCanvas,
        }
    }
}

impl From<Directive> for Mutation {
    fn from(directive: Directive) -> Self {
        match directive {
            Directive::AddComponent(request) => Mutation::AddComponent(request),
            Directive::UpdateComponent { id, properties } => {
                Mutation::UpdateComponent { id, properties }
            }
            Directive::ReplaceTheme(patch) => Mutation::ReplaceTheme(patch),
            Directive::UpdateLayout(patch) => Mutation::UpdateLayout(patch),
            Directive::RemoveComponent { id } => Mutation::RemoveComponent { id },
            Directive::SelectComponent { id } => Mutation::SelectComponent { id },
            Directive::SetViewport { viewport } => Mutation::SetViewport {
                name: viewport.as_str().to_string(),
            },
            Directive::UpdateCanvas(patch) => Mutation::UpdateCanvas(patch),
        }
    }
}

#[derive(Deserialize)]
struct SizeData {
    #[serde(alias = "w")]
    width: i64,
    #[serde(alias = "h")]
    height: i64,
}

#[derive(Deserialize)]
struct AddComponentData {
    #[serde(rename = "type")]
    kind: String,
    category: String,
    properties: PropertyBag,
    size: SizeData,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct UpdateComponentData {
    id: String,
    properties: PropertyBag,
}

#[derive(Deserialize)]
struct TargetData {
    id: String,
}

#[derive(Deserialize)]
struct ViewportData {
    #[serde(alias = "name")]
    viewport: String,
}

/// Validate a directive proposed by the language model. Only the four
/// model actions are accepted.
pub fn validate(directive: &Value) -> Result<Directive, DirectiveError> {
    let object = directive.as_object().ok_or(DirectiveError::NotAnObject)?;
    let name = object
        .get("action")
        .and_then(Value::as_str)
        .ok_or(DirectiveError::MissingAction)?;
    let action =
        DirectiveAction::parse(name).ok_or_else(|| DirectiveError::UnknownAction(name.to_string()))?;
    if !action.is_model_action() {
        return Err(DirectiveError::NotPermitted(action));
    }
    let data = object
        .get("data")
        .filter(|data| data.is_object())
        .ok_or(DirectiveError::MissingData)?;
    decode(action, data)
}

/// Validate a `view_update` sent by a connected client, which may use the
/// full action set.
pub fn validate_view_update(name: &str, data: &Value) -> Result<Directive, DirectiveError> {
    let action =
        DirectiveAction::parse(name).ok_or_else(|| DirectiveError::UnknownAction(name.to_string()))?;
    if !data.is_object() {
        return Err(DirectiveError::MissingData);
    }
    decode(action, data)
}

fn decode(action: DirectiveAction, data: &Value) -> Result<Directive, DirectiveError> {
    let malformed = |reason: String| DirectiveError::MalformedPayload { action, reason };

    match action {
        DirectiveAction::AddComponent => {
            let payload: AddComponentData = payload(action, data)?;
            if payload.kind.trim().is_empty() {
                return Err(malformed("`type` is empty".to_string()));
            }
            let category = payload
                .category
                .parse::<ComponentCategory>()
                .map_err(malformed)?;
            let size = Size::new(payload.size.width, payload.size.height).ok_or_else(|| {
                malformed(format!(
                    "size must be positive, got {}x{}",
                    payload.size.width, payload.size.height
                ))
            })?;
            let mut request = NewComponent::new(payload.kind.trim(), category, size)
                .with_properties(payload.properties);
            if let Some(name) = payload.name {
                request = request.with_name(name);
            }
            Ok(Directive::AddComponent(request))
        }
        DirectiveAction::UpdateComponent => {
            let payload: UpdateComponentData = payload(action, data)?;
            if payload.id.trim().is_empty() {
                return Err(malformed("`id` is empty".to_string()));
            }
            Ok(Directive::UpdateComponent {
                id: payload.id,
                properties: payload.properties,
            })
        }
        DirectiveAction::ReplaceTheme => {
            let patch: ThemePatch = payload(action, data)?;
            if patch.colors.is_empty() && patch.effects.is_empty() && patch.name.is_none() {
                return Err(malformed("no colors, effects or name given".to_string()));
            }
            Ok(Directive::ReplaceTheme(patch))
        }
        DirectiveAction::UpdateLayout => {
            let patch: LayoutPatch = payload(action, data)?;
            if patch.is_empty() {
                return Err(malformed("no layout fields given".to_string()));
            }
            Ok(Directive::UpdateLayout(patch))
        }
        DirectiveAction::RemoveComponent => {
            let target: TargetData = payload(action, data)?;
            if target.id.trim().is_empty() {
                return Err(malformed("`id` is empty".to_string()));
            }
            Ok(Directive::RemoveComponent { id: target.id })
        }
        DirectiveAction::SelectComponent => {
            // An empty id is a valid request to clear the selection.
            let target: TargetData = payload(action, data)?;
            Ok(Directive::SelectComponent { id: target.id })
        }
        DirectiveAction::SetViewport => {
            let target: ViewportData = payload(action, data)?;
            let viewport = target.viewport.parse::<Viewport>().map_err(malformed)?;
            Ok(Directive::SetViewport { viewport })
        }
        DirectiveAction::UpdateCanvas => {
            let patch: CanvasPatch = payload(action, data)?;
            if patch.viewport.is_none() && patch.zoom.is_none() && patch.pan.is_none() {
                return Err(malformed("no canvas fields given".to_string()));
            }
            Ok(Directive::UpdateCanvas(patch))
        }
    }
}

fn payload<T: DeserializeOwned>(action: DirectiveAction, data: &Value) -> Result<T, DirectiveError> {
    T::deserialize(data).map_err(|e| DirectiveError::MalformedPayload {
        action,
        reason: e.to_string(),
    })
}
