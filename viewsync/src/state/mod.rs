//! State Model: the one authoritative [`ViewState`] and its mutators.
//!
//! All access goes through [`StateModel`], which serializes every read and
//! write behind a single mutex. Mutators never perform I/O; callers that
//! need to publish a change do so from the `publish` hook of
//! [`StateModel::apply`], which runs while the lock is still held so that
//! observers see changes in the order they were applied.

pub mod placement;
pub mod types;

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

pub use placement::{PlacementConfig, PlacementPlanner};
pub use types::*;

/// Upper bound accepted for `LayoutState::columns`.
pub const MAX_LAYOUT_COLUMNS: u32 = 48;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StateError {
    #[error("component size must be positive, got {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("duplicate component id `{0}`")]
    DuplicateId(String),

    #[error("invalid view snapshot: {0}")]
    InvalidSnapshot(String),
}

/// A single requested change to the view.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    AddComponent(NewComponent),
    UpdateComponent { id: String, properties: PropertyBag },
    RemoveComponent { id: String },
    ReplaceTheme(ThemePatch),
    UpdateLayout(LayoutPatch),
    SelectComponent { id: String },
    SetViewport { name: String },
    UpdateCanvas(CanvasPatch),
    ReplaceAll(ViewState),
}

/// What actually changed, carrying the post-change value.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    ComponentAdded(Component),
    ComponentUpdated(Component),
    ComponentRemoved { id: String },
    ThemeReplaced(ThemeState),
    LayoutReplaced(LayoutState),
    CanvasChanged(CanvasState),
    Replaced(ViewState),
}

impl StateChange {
    /// Incremental-update action name, `None` for wholesale replacement.
    pub fn action(&self) -> Option<&'static str> {
        match self {
            Self::ComponentAdded(_) => Some("add_component"),
            Self::ComponentUpdated(_) => Some("update_component"),
            Self::ComponentRemoved { .. } => Some("remove_component"),
            Self::ThemeReplaced(_) => Some("replace_theme"),
            Self::LayoutReplaced(_) => Some("update_layout"),
            Self::CanvasChanged(_) => Some("update_canvas"),
            Self::Replaced(_) => None,
        }
    }

    pub fn data(&self) -> Value {
        let encoded = match self {
            Self::ComponentAdded(component) | Self::ComponentUpdated(component) => {
                serde_json::to_value(component)
            }
            Self::ComponentRemoved { id } => Ok(json!({ "id": id })),
            Self::ThemeReplaced(theme) => serde_json::to_value(theme),
            Self::LayoutReplaced(layout) => serde_json::to_value(layout),
            Self::CanvasChanged(canvas) => serde_json::to_value(canvas),
            Self::Replaced(view) => serde_json::to_value(view),
        };
        encoded.unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Applied(StateChange),
    /// The target component does not exist; nothing changed.
    NotFound { id: String },
    /// Every field in the request was unknown or invalid and was ignored.
    Unchanged,
}

impl MutationOutcome {
    pub fn change(&self) -> Option<&StateChange> {
        match self {
            Self::Applied(change) => Some(change),
            _ => None,
        }
    }
}

pub struct StateModel {
    view: Mutex<ViewState>,
    planner: PlacementPlanner,
}

impl StateModel {
    pub fn new(planner: PlacementPlanner) -> Self {
        Self::with_view(ViewState::default(), planner)
    }

    pub fn with_view(view: ViewState, planner: PlacementPlanner) -> Self {
        Self {
            view: Mutex::new(view),
            planner,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        // Mutators leave the view consistent before any point that could
        // panic, so a poisoned lock still guards valid state.
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deep copy of the current view.
    pub fn snapshot(&self) -> ViewState {
        self.lock().clone()
    }

    /// Run `f` against the current view while holding the lock, so nothing
    /// can change between reading the view and acting on it.
    pub fn with_snapshot<R>(&self, f: impl FnOnce(&ViewState) -> R) -> R {
        let view = self.lock();
        f(&view)
    }

    pub fn component_count(&self) -> usize {
        self.lock().components.len()
    }

    pub fn add_component(&self, request: NewComponent) -> Result<Component, StateError> {
        let mut view = self.lock();
        add_component(&mut view, &self.planner, request)
    }

    /// Merge `patch` into the component's properties. `None` if the id is unknown.
    pub fn update_component(&self, id: &str, patch: PropertyBag) -> Option<Component> {
        let mut view = self.lock();
        update_component(&mut view, id, patch)
    }

    pub fn remove_component(&self, id: &str) -> Option<Component> {
        let mut view = self.lock();
        remove_component(&mut view, id)
    }

    pub fn replace_theme(&self, patch: ThemePatch) -> ThemeState {
        let mut view = self.lock();
        replace_theme(&mut view.theme, patch);
        view.theme.clone()
    }

    pub fn replace_layout(&self, patch: LayoutPatch) -> LayoutState {
        let mut view = self.lock();
        replace_layout(&mut view.layout, patch);
        view.layout.clone()
    }

    /// Select a component by id; an empty id clears the selection. Returns
    /// `false` when the id does not exist.
    pub fn set_selection(&self, id: &str) -> bool {
        let mut view = self.lock();
        set_selection(&mut view, id)
    }

    /// Unknown viewport names are ignored and yield `None`.
    pub fn set_viewport(&self, name: &str) -> Option<Viewport> {
        let mut view = self.lock();
        let viewport = name.parse::<Viewport>().ok()?;
        view.canvas.viewport = viewport;
        Some(viewport)
    }

    pub fn set_zoom(&self, zoom: f64) -> bool {
        let mut view = self.lock();
        set_zoom(&mut view.canvas, zoom)
    }

    pub fn set_pan(&self, pan: PanOffset) -> bool {
        let mut view = self.lock();
        set_pan(&mut view.canvas, pan)
    }

    /// Swap in a whole new view after checking its invariants.
    pub fn replace(&self, next: ViewState) -> Result<(), StateError> {
        let mut view = self.lock();
        *view = checked_view(next)?;
        Ok(())
    }

    /// Apply `mutation` and, if it changed anything, hand the change to
    /// `publish` before releasing the lock.
    pub fn apply<F>(&self, mutation: Mutation, publish: F) -> Result<MutationOutcome, StateError>
    where
        F: FnOnce(&StateChange),
    {
        let mut view = self.lock();
        let outcome = self.apply_locked(&mut view, mutation)?;
        match &outcome {
            MutationOutcome::Applied(change) => publish(change),
            MutationOutcome::NotFound { id } => {
                debug!("[State] Mutation target `{}` not found", id);
            }
            MutationOutcome::Unchanged => debug!("[State] Mutation ignored: nothing to change"),
        }
        Ok(outcome)
    }

    fn apply_locked(
        &self,
        view: &mut ViewState,
        mutation: Mutation,
    ) -> Result<MutationOutcome, StateError> {
        let outcome = match mutation {
            Mutation::AddComponent(request) => MutationOutcome::Applied(
                StateChange::ComponentAdded(add_component(view, &self.planner, request)?),
            ),
            Mutation::UpdateComponent { id, properties } => {
                match update_component(view, &id, properties) {
                    Some(component) => {
                        MutationOutcome::Applied(StateChange::ComponentUpdated(component))
                    }
                    None => MutationOutcome::NotFound { id },
                }
            }
            Mutation::RemoveComponent { id } => match remove_component(view, &id) {
                Some(_) => MutationOutcome::Applied(StateChange::ComponentRemoved { id }),
                None => MutationOutcome::NotFound { id },
            },
            Mutation::ReplaceTheme(patch) => {
                if replace_theme(&mut view.theme, patch) {
                    MutationOutcome::Applied(StateChange::ThemeReplaced(view.theme.clone()))
                } else {
                    MutationOutcome::Unchanged
                }
            }
            Mutation::UpdateLayout(patch) => {
                if replace_layout(&mut view.layout, patch) {
                    MutationOutcome::Applied(StateChange::LayoutReplaced(view.layout.clone()))
                } else {
                    MutationOutcome::Unchanged
                }
            }
            Mutation::SelectComponent { id } => {
                if set_selection(view, &id) {
                    MutationOutcome::Applied(StateChange::CanvasChanged(view.canvas.clone()))
                } else {
                    MutationOutcome::NotFound { id }
                }
            }
            Mutation::SetViewport { name } => match name.parse::<Viewport>() {
                Ok(viewport) => {
                    view.canvas.viewport = viewport;
                    MutationOutcome::Applied(StateChange::CanvasChanged(view.canvas.clone()))
                }
                Err(reason) => {
                    debug!("[State] Ignoring viewport change: {}", reason);
                    MutationOutcome::Unchanged
                }
            },
            Mutation::UpdateCanvas(patch) => {
                if update_canvas(&mut view.canvas, patch) {
                    MutationOutcome::Applied(StateChange::CanvasChanged(view.canvas.clone()))
                } else {
                    MutationOutcome::Unchanged
                }
            }
            Mutation::ReplaceAll(next) => {
                *view = checked_view(next)?;
                MutationOutcome::Applied(StateChange::Replaced(view.clone()))
            }
        };
        Ok(outcome)
    }
}

impl Default for StateModel {
    fn default() -> Self {
        Self::new(PlacementPlanner::default())
    }
}

impl std::fmt::Debug for StateModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateModel")
            .field("components", &self.component_count())
            .finish()
    }
}

fn add_component(
    view: &mut ViewState,
    planner: &PlacementPlanner,
    request: NewComponent,
) -> Result<Component, StateError> {
    if !request.size.is_valid() {
        return Err(StateError::InvalidSize {
            width: request.size.width,
            height: request.size.height,
        });
    }

    let mut id = Component::fresh_id();
    while view.contains(&id) {
        id = Component::fresh_id();
    }

    let position = planner.place(&view.positions());
    let name = request
        .name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| default_name(&request.kind));
    let component = Component {
        id,
        kind: request.kind,
        name,
        category: request.category,
        properties: request.properties,
        position,
        size: request.size,
    };
    view.components.push(component.clone());
    Ok(component)
}

fn default_name(kind: &str) -> String {
    let mut chars = kind.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Component".to_string(),
    }
}

fn update_component(view: &mut ViewState, id: &str, patch: PropertyBag) -> Option<Component> {
    let component = view.component_mut(id)?;
    for (key, value) in patch {
        component.properties.insert(key, value);
    }
    Some(component.clone())
}

fn remove_component(view: &mut ViewState, id: &str) -> Option<Component> {
    let index = view
        .components
        .iter()
        .position(|component| component.id == id)?;
    let removed = view.components.remove(index);
    if view.canvas.selected == id {
        view.canvas.selected.clear();
    }
    Some(removed)
}

/// Returns whether any recognized field was applied.
fn replace_theme(theme: &mut ThemeState, patch: ThemePatch) -> bool {
    let mut touched = false;
    if let Some(name) = patch.name.filter(|name| !name.trim().is_empty()) {
        theme.name = name;
        touched = true;
    }
    for (role, color) in patch.colors {
        if !COLOR_ROLES.contains(&role.as_str()) || color.trim().is_empty() {
            debug!("[State] Ignoring theme color `{}`", role);
            continue;
        }
        theme.colors.insert(role, color.trim().to_string());
        touched = true;
    }
    for (flag, enabled) in patch.effects {
        if !EFFECT_FLAGS.contains(&flag.as_str()) {
            debug!("[State] Ignoring theme effect `{}`", flag);
            continue;
        }
        theme.effects.insert(flag, enabled);
        touched = true;
    }
    touched
}

fn replace_layout(layout: &mut LayoutState, patch: LayoutPatch) -> bool {
    let mut touched = false;
    if let Some(columns) = patch
        .columns
        .filter(|columns| (1..=MAX_LAYOUT_COLUMNS).contains(columns))
    {
        layout.columns = columns;
        touched = true;
    }
    if let Some(row_height) = patch.row_height.filter(|height| *height > 0) {
        layout.row_height = row_height;
        touched = true;
    }
    if let Some(margin) = patch.margin {
        layout.margin = margin;
        touched = true;
    }
    if let Some(padding) = patch.container_padding {
        layout.container_padding = padding;
        touched = true;
    }
    if let Some(show_grid) = patch.show_grid {
        layout.show_grid = show_grid;
        touched = true;
    }
    if let Some(snap) = patch.snap_to_grid {
        layout.snap_to_grid = snap;
        touched = true;
    }
    touched
}

fn set_selection(view: &mut ViewState, id: &str) -> bool {
    if id.is_empty() {
        view.canvas.selected.clear();
        return true;
    }
    if !view.contains(id) {
        return false;
    }
    view.canvas.selected = id.to_string();
    true
}

fn set_zoom(canvas: &mut CanvasState, zoom: f64) -> bool {
    if !zoom.is_finite() || zoom <= 0.0 {
        return false;
    }
    canvas.zoom = zoom;
    true
}

fn set_pan(canvas: &mut CanvasState, pan: PanOffset) -> bool {
    if !pan.x.is_finite() || !pan.y.is_finite() {
        return false;
    }
    canvas.pan = pan;
    true
}

fn update_canvas(canvas: &mut CanvasState, patch: CanvasPatch) -> bool {
    let mut touched = false;
    if let Some(viewport) = patch.viewport.and_then(|name| name.parse::<Viewport>().ok()) {
        canvas.viewport = viewport;
        touched = true;
    }
    if let Some(zoom) = patch.zoom {
        touched |= set_zoom(canvas, zoom);
    }
    if let Some(pan) = patch.pan {
        touched |= set_pan(canvas, pan);
    }
    touched
}

fn checked_view(mut next: ViewState) -> Result<ViewState, StateError> {
    let mut seen = HashSet::with_capacity(next.components.len());
    for component in &next.components {
        if component.id.trim().is_empty() {
            return Err(StateError::InvalidSnapshot(
                "component with empty id".to_string(),
            ));
        }
        if !seen.insert(component.id.as_str()) {
            return Err(StateError::DuplicateId(component.id.clone()));
        }
        if !component.size.is_valid() {
            return Err(StateError::InvalidSize {
                width: component.size.width,
                height: component.size.height,
            });
        }
    }
    if !next.canvas.zoom.is_finite() || next.canvas.zoom <= 0.0 {
        return Err(StateError::InvalidSnapshot(format!(
            "zoom must be positive, got {}",
            next.canvas.zoom
        )));
    }
    if !next.canvas.selected.is_empty() && !next.contains(&next.canvas.selected) {
        next.canvas.selected.clear();
    }
    Ok(next)
}
