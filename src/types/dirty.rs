/// Change tracking shared by entities, containers and mutable value objects.
///
/// `dirty()` takes `&mut self` because producing an entity diff settles its
/// pending version bump.
pub trait DirtyTrackable {
    fn is_dirty(&self) -> bool;

    /// Sparse diff since the last persisted state, `None` when nothing changed.
    fn dirty(&mut self) -> Option<serde_json::Value>;

    /// Full projection for external consumers.
    fn data(&self) -> serde_json::Value;

    /// Folds pending changes into the baseline once they are stored.
    fn mark_persisted(&mut self);
}
