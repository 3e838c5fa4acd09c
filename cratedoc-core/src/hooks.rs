// src/hooks.rs
//! Hook Registry (spec §4.8): ordered lifecycle callback lists a collection
//! runs its writes through. `pre*` hooks can reject a write by returning an
//! `Err`; `post*` hooks run after the write has committed and cannot abort
//! it - a `post*` hook's error is logged, not propagated, since the write
//! already landed.

use crate::document::Document;
use crate::error::{Error, Result};
use crate::log_warn;

/// A lifecycle point a hook can be registered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PreCreate,
    PostCreate,
    PreInsert,
    PostInsert,
    PreSave,
    PostSave,
    PreRemove,
    PostRemove,
}

impl HookPoint {
    /// The name a failing hook's error message is prefixed with (spec
    /// §4.8). Hooks themselves are anonymous closures, so the slot they're
    /// registered under is the only identity available to name them by.
    fn name(self) -> &'static str {
        match self {
            HookPoint::PreCreate => "preCreate",
            HookPoint::PostCreate => "postCreate",
            HookPoint::PreInsert => "preInsert",
            HookPoint::PostInsert => "postInsert",
            HookPoint::PreSave => "preSave",
            HookPoint::PostSave => "postSave",
            HookPoint::PreRemove => "preRemove",
            HookPoint::PostRemove => "postRemove",
        }
    }
}

pub type PreHook = Box<dyn Fn(&mut Document) -> Result<()> + Send + Sync>;
pub type PostHook = Box<dyn Fn(&Document) + Send + Sync>;

/// Ordered, per-collection callback lists keyed by lifecycle point.
/// `pre*` hooks run in registration order and the first `Err` aborts the
/// write before anything is persisted; `post*` hooks all run, in
/// registration order, after the write commits.
#[derive(Default)]
pub struct HookRegistry {
    pre_create: Vec<PreHook>,
    post_create: Vec<PostHook>,
    pre_insert: Vec<PreHook>,
    post_insert: Vec<PostHook>,
    pre_save: Vec<PreHook>,
    post_save: Vec<PostHook>,
    pre_remove: Vec<PreHook>,
    post_remove: Vec<PostHook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        HookRegistry::default()
    }

    pub fn on_pre_create(&mut self, hook: PreHook) {
        self.pre_create.push(hook);
    }
    pub fn on_post_create(&mut self, hook: PostHook) {
        self.post_create.push(hook);
    }
    pub fn on_pre_insert(&mut self, hook: PreHook) {
        self.pre_insert.push(hook);
    }
    pub fn on_post_insert(&mut self, hook: PostHook) {
        self.post_insert.push(hook);
    }
    pub fn on_pre_save(&mut self, hook: PreHook) {
        self.pre_save.push(hook);
    }
    pub fn on_post_save(&mut self, hook: PostHook) {
        self.post_save.push(hook);
    }
    pub fn on_pre_remove(&mut self, hook: PreHook) {
        self.pre_remove.push(hook);
    }
    pub fn on_post_remove(&mut self, hook: PostHook) {
        self.post_remove.push(hook);
    }

    /// Run every `pre*` hook registered for `point` against `doc`, in
    /// registration order, stopping at (and returning) the first error.
    pub fn run_pre(&self, point: HookPoint, doc: &mut Document) -> Result<()> {
        let hooks: &[PreHook] = match point {
            HookPoint::PreCreate => &self.pre_create,
            HookPoint::PreInsert => &self.pre_insert,
            HookPoint::PreSave => &self.pre_save,
            HookPoint::PreRemove => &self.pre_remove,
            _ => return Ok(()),
        };
        for hook in hooks {
            hook(doc).map_err(|e| Error::new(e.kind(), format!("{}: {}", point.name(), e.message)))?;
        }
        Ok(())
    }

    /// Run every `post*` hook registered for `point`. Hooks observe the
    /// committed document but cannot affect the write that already landed.
    pub fn run_post(&self, point: HookPoint, doc: &Document) {
        let hooks: &[PostHook] = match point {
            HookPoint::PostCreate => &self.post_create,
            HookPoint::PostInsert => &self.post_insert,
            HookPoint::PostSave => &self.post_save,
            HookPoint::PostRemove => &self.post_remove,
            _ => return,
        };
        for hook in hooks {
            hook(doc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn pre_insert_hook_can_mutate_document() {
        let mut registry = HookRegistry::new();
        registry.on_pre_insert(Box::new(|doc| {
            doc.set("stamped", json!(true));
            Ok(())
        }));

        let mut doc = Document::from_value(json!({"name": "Alice"})).unwrap();
        registry.run_pre(HookPoint::PreInsert, &mut doc).unwrap();
        assert_eq!(doc.get("stamped"), Some(&json!(true)));
    }

    #[test]
    fn pre_insert_hook_can_reject_write() {
        let mut registry = HookRegistry::new();
        registry.on_pre_insert(Box::new(|_doc| Err(Error::validation("rejected"))));

        let mut doc = Document::from_value(json!({})).unwrap();
        assert!(registry.run_pre(HookPoint::PreInsert, &mut doc).is_err());
    }

    #[test]
    fn hooks_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();

        let o1 = order.clone();
        registry.on_pre_insert(Box::new(move |_doc| {
            o1.lock().push(1);
            Ok(())
        }));
        let o2 = order.clone();
        registry.on_pre_insert(Box::new(move |_doc| {
            o2.lock().push(2);
            Ok(())
        }));

        let mut doc = Document::from_value(json!({})).unwrap();
        registry.run_pre(HookPoint::PreInsert, &mut doc).unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn post_hooks_do_not_affect_write_outcome() {
        let mut registry = HookRegistry::new();
        registry.on_post_insert(Box::new(|_doc| {}));
        let doc = Document::from_value(json!({})).unwrap();
        registry.run_post(HookPoint::PostInsert, &doc);
    }
}
