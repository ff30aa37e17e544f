// Versioned viewer state: one global record plus one record per viewer mode.
//
// Mutations go through dot-path deep-sets against the serialized form of
// the state, then round-trip back into the typed structs. A write that
// does not fit the typed schema (wrong type for a known field) fails the
// round trip and is treated as a no-op; unknown keys survive in `extra`
// maps so forward-compatible payloads are not silently dropped.

pub mod path;
pub mod persist;
pub mod snapshot;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use slicesync_common::types::{Annotation, Measurement, ViewportState};

use self::path::{get_path, set_path, PathWrite};

/// Smallest zoom the store will hold after normalization.
const MIN_ZOOM: f64 = 0.01;

// ── State records ───────────────────────────────────────────────────

/// The whole state tree owned by the local process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GlobalState {
    pub current_mode: Option<String>,
    pub viewer_states: BTreeMap<String, ViewerState>,
    /// Opaque references owned by the loading layer.
    pub current_study: Option<Value>,
    pub loaded_studies: Vec<Value>,
    pub user_preferences: Value,
    pub application: ApplicationInfo,
    pub collaboration: CollaborationStatus,
    pub performance: PerformanceStats,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            current_mode: None,
            viewer_states: BTreeMap::new(),
            current_study: None,
            loaded_studies: Vec::new(),
            user_preferences: Value::Object(Map::new()),
            application: ApplicationInfo::default(),
            collaboration: CollaborationStatus::default(),
            performance: PerformanceStats::default(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationInfo {
    pub name: String,
    pub version: String,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for ApplicationInfo {
    fn default() -> Self {
        Self {
            name: "slicesync".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            started_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollaborationStatus {
    pub active: bool,
    pub session_id: Option<Uuid>,
    pub participant_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerformanceStats {
    pub update_count: u64,
    pub last_update_at: Option<DateTime<Utc>>,
}

/// Per-mode viewer state. Created lazily on first touch of a mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewerState {
    pub current_image_id: Option<String>,
    pub current_slice_index: u32,
    pub total_slices: u32,
    pub viewport: ViewportState,
    pub tools: ToolState,
    pub measurements: Vec<Measurement>,
    pub annotations: Vec<Annotation>,
    pub ui: UiPanels,
    pub session: ViewerActivity,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for ViewerState {
    fn default() -> Self {
        Self {
            current_image_id: None,
            current_slice_index: 0,
            total_slices: 0,
            viewport: ViewportState::default(),
            tools: ToolState::default(),
            measurements: Vec::new(),
            annotations: Vec::new(),
            ui: UiPanels::default(),
            session: ViewerActivity::default(),
            extra: BTreeMap::new(),
        }
    }
}

impl ViewerState {
    /// A fresh viewer whose activity clock starts at `now`.
    pub fn activated(now: DateTime<Utc>) -> Self {
        let mut state = Self::default();
        state.session.start_time = Some(now);
        state.session.last_activity = Some(now);
        state
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolState {
    pub active_tool: Option<String>,
    pub tool_settings: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UiPanels {
    pub show_overlays: bool,
    pub show_thumbnails: bool,
    pub show_measurements_panel: bool,
}

impl Default for UiPanels {
    fn default() -> Self {
        Self { show_overlays: true, show_thumbnails: true, show_measurements_panel: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewerActivity {
    pub start_time: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub interaction_count: u64,
    #[serde(default = "Uuid::new_v4")]
    pub session_id: Uuid,
}

impl Default for ViewerActivity {
    fn default() -> Self {
        Self {
            start_time: None,
            last_activity: None,
            interaction_count: 0,
            session_id: Uuid::new_v4(),
        }
    }
}

// ── Change events ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeScope {
    Global,
    Viewer { mode: String },
}

/// Produced exactly once per mutating call; never batched.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChangeEvent {
    pub scope: ChangeScope,
    /// Path relative to the scope root.
    pub path: String,
    pub old_value: Option<Value>,
    pub new_value: Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

// ── Store ───────────────────────────────────────────────────────────

/// In-process store for the global state tree.
///
/// Reads hand out references; callers must not mutate in place. All
/// mutation goes through the path-update and mode-switch operations so
/// that every change produces exactly one [`StateChangeEvent`].
#[derive(Debug, Default)]
pub struct StateStore {
    state: GlobalState,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &GlobalState {
        &self.state
    }

    pub fn viewer_state(&self, mode: &str) -> Option<&ViewerState> {
        self.state.viewer_states.get(mode)
    }

    /// Deep-set `value` at `path` under the global root.
    ///
    /// Unknown/empty paths and writes that break the typed schema are
    /// tolerated as no-ops (`None`).
    pub fn update_state(
        &mut self,
        path: &str,
        value: Value,
        source: &str,
        now: DateTime<Utc>,
    ) -> Option<StateChangeEvent> {
        let (old_value, new_value) = self.apply_path(path, value, now)?;
        Some(StateChangeEvent {
            scope: ChangeScope::Global,
            path: path.to_string(),
            old_value,
            new_value,
            source: source.to_string(),
            timestamp: now,
        })
    }

    /// Deep-set `value` at `path` under `viewer_states.<mode>`, creating
    /// the mode's viewer with defaults if absent.
    pub fn update_viewer_state(
        &mut self,
        mode: &str,
        path: &str,
        value: Value,
        source: &str,
        now: DateTime<Utc>,
    ) -> Option<StateChangeEvent> {
        if path.is_empty() || mode.is_empty() {
            return None;
        }
        let created = !self.state.viewer_states.contains_key(mode);
        if created {
            self.state.viewer_states.insert(mode.to_string(), ViewerState::activated(now));
        }

        let full_path = format!("viewer_states.{mode}.{path}");
        // A rejected write must not leave a freshly created viewer behind;
        // no-op calls make no mutation at all.
        let Some((old_value, new_value)) = self.apply_path(&full_path, value, now) else {
            if created {
                self.state.viewer_states.remove(mode);
            }
            return None;
        };

        if let Some(viewer) = self.state.viewer_states.get_mut(mode) {
            viewer.session.last_activity = Some(now);
            viewer.session.interaction_count += 1;
        }

        Some(StateChangeEvent {
            scope: ChangeScope::Viewer { mode: mode.to_string() },
            path: path.to_string(),
            old_value,
            new_value,
            source: source.to_string(),
            timestamp: now,
        })
    }

    /// Activate `mode`. With `preserve_state` the mode's prior viewer
    /// state (if any) is reused untouched; without it the viewer is reset
    /// to defaults before activation.
    pub fn switch_mode(
        &mut self,
        mode: &str,
        preserve_state: bool,
        source: &str,
        now: DateTime<Utc>,
    ) -> StateChangeEvent {
        let old_mode = self.state.current_mode.clone();

        if !preserve_state || !self.state.viewer_states.contains_key(mode) {
            self.state.viewer_states.insert(mode.to_string(), ViewerState::activated(now));
        }
        self.state.current_mode = Some(mode.to_string());
        self.touch(now);

        StateChangeEvent {
            scope: ChangeScope::Global,
            path: "current_mode".to_string(),
            old_value: Some(old_mode.map_or(Value::Null, Value::String)),
            new_value: Value::String(mode.to_string()),
            source: source.to_string(),
            timestamp: now,
        }
    }

    /// Replace the whole state wholesale (snapshot restore, import).
    pub fn replace(&mut self, state: GlobalState) {
        self.state = state;
        self.normalize();
    }

    /// Full reset to defaults. The only operation that drops viewer states.
    pub fn reset(&mut self) {
        self.state = GlobalState::default();
    }

    // Shared path-update plumbing: serialize, set, round-trip, normalize.
    // Returns (old value, canonical value after normalization).
    fn apply_path(
        &mut self,
        path: &str,
        value: Value,
        now: DateTime<Utc>,
    ) -> Option<(Option<Value>, Value)> {
        let mut tree = match serde_json::to_value(&self.state) {
            Ok(tree) => tree,
            Err(error) => {
                warn!(?error, "state serialization failed; update dropped");
                return None;
            }
        };

        let previous = match set_path(&mut tree, path, value) {
            PathWrite::Applied { previous } => previous,
            PathWrite::Ignored => return None,
        };

        let new_state: GlobalState = match serde_json::from_value(tree) {
            Ok(state) => state,
            Err(error) => {
                debug!(path, ?error, "update does not fit state schema; ignored");
                return None;
            }
        };

        self.state = new_state;
        self.normalize();
        self.touch(now);

        let canonical = serde_json::to_value(&self.state)
            .ok()
            .and_then(|tree| get_path(&tree, path).cloned())
            .unwrap_or(Value::Null);
        Some((previous, canonical))
    }

    // Re-establish invariants: slice index within range, zoom positive.
    fn normalize(&mut self) {
        for viewer in self.state.viewer_states.values_mut() {
            let max_index = viewer.total_slices.saturating_sub(1);
            if viewer.current_slice_index > max_index {
                viewer.current_slice_index = max_index;
            }
            if !viewer.viewport.zoom.is_finite() {
                viewer.viewport.zoom = 1.0;
            } else if viewer.viewport.zoom < MIN_ZOOM {
                viewer.viewport.zoom = MIN_ZOOM;
            }
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.state.performance.update_count += 1;
        self.state.performance.last_update_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        "2026-02-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn update_then_read_reflects_value_with_one_event() {
        let mut store = StateStore::new();
        let event = store
            .update_state("user_preferences.theme", json!("dark"), "test", now())
            .expect("update should apply");

        assert_eq!(event.scope, ChangeScope::Global);
        assert_eq!(event.path, "user_preferences.theme");
        assert_eq!(event.old_value, None);
        assert_eq!(event.new_value, json!("dark"));
        assert_eq!(store.state().user_preferences["theme"], json!("dark"));
    }

    #[test]
    fn update_reports_old_value_on_overwrite() {
        let mut store = StateStore::new();
        store.update_state("user_preferences.theme", json!("dark"), "test", now());
        let event = store
            .update_state("user_preferences.theme", json!("light"), "test", now())
            .expect("update should apply");
        assert_eq!(event.old_value, Some(json!("dark")));
        assert_eq!(event.new_value, json!("light"));
    }

    #[test]
    fn empty_path_is_a_no_op() {
        let mut store = StateStore::new();
        assert!(store.update_state("", json!(1), "test", now()).is_none());
        assert_eq!(store.state().performance.update_count, 0);
    }

    #[test]
    fn type_mismatch_is_rejected_without_mutation() {
        let mut store = StateStore::new();
        // current_slice_index is numeric; a string must not stick.
        store.switch_mode("simple", true, "test", now());
        let result = store.update_viewer_state(
            "simple",
            "current_slice_index",
            json!("not-a-number"),
            "test",
            now(),
        );
        assert!(result.is_none());
        assert_eq!(store.viewer_state("simple").unwrap().current_slice_index, 0);
    }

    #[test]
    fn unknown_extra_key_is_preserved() {
        let mut store = StateStore::new();
        store
            .update_state("plugin_panel_width", json!(320), "test", now())
            .expect("unknown top-level keys land in extras");
        assert_eq!(store.state().extra.get("plugin_panel_width"), Some(&json!(320)));
    }

    #[test]
    fn viewer_state_is_created_lazily_with_defaults() {
        let mut store = StateStore::new();
        assert!(store.viewer_state("mpr").is_none());

        store
            .update_viewer_state("mpr", "viewport.zoom", json!(2.0), "test", now())
            .expect("update should apply");

        let viewer = store.viewer_state("mpr").expect("viewer should exist now");
        assert_eq!(viewer.viewport.zoom, 2.0);
        assert_eq!(viewer.current_slice_index, 0);
        assert_eq!(viewer.total_slices, 0);
        assert_eq!(viewer.session.start_time, Some(now()));
    }

    #[test]
    fn rejected_viewer_write_does_not_leave_a_fresh_viewer_behind() {
        let mut store = StateStore::new();

        // Writing through a scalar is a no-op; a mode created only for
        // this call must disappear again.
        let event = store.update_viewer_state("mpr", "viewport.zoom.x", json!(1.0), "test", now());
        assert!(event.is_none());
        assert!(store.viewer_state("mpr").is_none());

        // An existing viewer survives the same rejected write untouched.
        store
            .update_viewer_state("mpr", "viewport.zoom", json!(2.0), "test", now())
            .expect("update should apply");
        let event = store.update_viewer_state("mpr", "viewport.zoom.x", json!(1.0), "test", now());
        assert!(event.is_none());
        assert_eq!(store.viewer_state("mpr").unwrap().viewport.zoom, 2.0);
    }

    #[test]
    fn viewer_update_event_is_scoped_with_relative_path() {
        let mut store = StateStore::new();
        let event = store
            .update_viewer_state("simple", "viewport.zoom", json!(1.5), "test", now())
            .expect("update should apply");
        assert_eq!(event.scope, ChangeScope::Viewer { mode: "simple".into() });
        assert_eq!(event.path, "viewport.zoom");
        assert_eq!(event.new_value, json!(1.5));
    }

    #[test]
    fn switch_mode_preserving_keeps_prior_state() {
        let mut store = StateStore::new();
        store.switch_mode("simple", true, "test", now());
        store.update_viewer_state("simple", "viewport.zoom", json!(3.0), "test", now());

        store.switch_mode("mpr", true, "test", now());
        store.switch_mode("simple", true, "test", now());
        assert_eq!(store.viewer_state("simple").unwrap().viewport.zoom, 3.0);
    }

    #[test]
    fn switch_mode_without_preserve_resets_to_defaults() {
        let mut store = StateStore::new();
        store.switch_mode("simple", true, "test", now());
        store.update_viewer_state("simple", "viewport.zoom", json!(3.0), "test", now());

        store.switch_mode("simple", false, "test", now());
        assert_eq!(store.viewer_state("simple").unwrap().viewport.zoom, 1.0);
        assert_eq!(store.state().current_mode.as_deref(), Some("simple"));
    }

    #[test]
    fn switch_mode_event_carries_old_and_new_mode() {
        let mut store = StateStore::new();
        let first = store.switch_mode("simple", true, "test", now());
        assert_eq!(first.old_value, Some(Value::Null));
        assert_eq!(first.new_value, json!("simple"));

        let second = store.switch_mode("mpr", true, "test", now());
        assert_eq!(second.old_value, Some(json!("simple")));
        assert_eq!(second.new_value, json!("mpr"));
    }

    #[test]
    fn slice_index_is_clamped_when_total_slices_shrinks() {
        let mut store = StateStore::new();
        store.update_viewer_state("simple", "total_slices", json!(100), "test", now());
        store.update_viewer_state("simple", "current_slice_index", json!(80), "test", now());
        assert_eq!(store.viewer_state("simple").unwrap().current_slice_index, 80);

        let event = store
            .update_viewer_state("simple", "total_slices", json!(10), "test", now())
            .expect("shrink should apply");
        assert_eq!(event.new_value, json!(10));
        assert_eq!(store.viewer_state("simple").unwrap().current_slice_index, 9);
    }

    #[test]
    fn slice_index_beyond_range_is_clamped_on_write() {
        let mut store = StateStore::new();
        store.update_viewer_state("simple", "total_slices", json!(5), "test", now());
        let event = store
            .update_viewer_state("simple", "current_slice_index", json!(42), "test", now())
            .expect("write should apply");
        // Canonical value reflects the clamp.
        assert_eq!(event.new_value, json!(4));
        assert_eq!(store.viewer_state("simple").unwrap().current_slice_index, 4);
    }

    #[test]
    fn zoom_never_goes_nonpositive() {
        let mut store = StateStore::new();
        store.update_viewer_state("simple", "viewport.zoom", json!(-2.0), "test", now());
        assert!(store.viewer_state("simple").unwrap().viewport.zoom > 0.0);
    }

    #[test]
    fn updates_bump_performance_counters() {
        let mut store = StateStore::new();
        store.update_state("user_preferences.a", json!(1), "test", now());
        store.update_viewer_state("simple", "viewport.zoom", json!(2.0), "test", now());
        assert_eq!(store.state().performance.update_count, 2);
        assert_eq!(store.state().performance.last_update_at, Some(now()));
    }

    #[test]
    fn deeply_nested_value_does_not_crash_the_store() {
        // JSON values cannot be cyclic; the store must still cope with
        // heavily self-similar nesting.
        let mut nested = json!({"leaf": true});
        for _ in 0..64 {
            nested = json!({"child": nested});
        }
        let mut store = StateStore::new();
        let event = store
            .update_state("user_preferences.tree", nested.clone(), "test", now())
            .expect("nested write should apply");
        assert_eq!(event.new_value, nested);
    }

    #[test]
    fn reset_drops_viewer_states() {
        let mut store = StateStore::new();
        store.switch_mode("simple", true, "test", now());
        store.reset();
        assert!(store.state().viewer_states.is_empty());
        assert_eq!(store.state().current_mode, None);
    }
}
