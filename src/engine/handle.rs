//! Owned engine handles
//!
//! Every native object the core holds lives in an [`Owned`] slot. Releasing
//! an empty slot is a no-op, replacing a slot releases the previous object,
//! and dropping the slot releases whatever it still holds.

use std::fmt;
use std::sync::Arc;

use super::{CaptureEngine, EncoderHandle, OutputHandle, SceneHandle, SourceHandle};

/// An engine object type that knows how to give itself back to the engine
pub trait EngineObject: Copy + PartialEq + fmt::Debug {
    fn release(self, engine: &dyn CaptureEngine);
}

impl EngineObject for SceneHandle {
    fn release(self, engine: &dyn CaptureEngine) {
        engine.release_scene(self);
    }
}

impl EngineObject for SourceHandle {
    fn release(self, engine: &dyn CaptureEngine) {
        engine.release_source(self);
    }
}

impl EngineObject for EncoderHandle {
    fn release(self, engine: &dyn CaptureEngine) {
        engine.release_encoder(self);
    }
}

impl EngineObject for OutputHandle {
    fn release(self, engine: &dyn CaptureEngine) {
        engine.release_output(self);
    }
}

/// Exclusive owner of at most one engine object
pub struct Owned<H: EngineObject> {
    handle: Option<H>,
    engine: Arc<dyn CaptureEngine>,
}

impl<H: EngineObject> Owned<H> {
    pub fn empty(engine: Arc<dyn CaptureEngine>) -> Self {
        Self {
            handle: None,
            engine,
        }
    }

    /// Current handle, if any. The returned copy is a non-owning view.
    pub fn get(&self) -> Option<H> {
        self.handle
    }

    pub fn is_some(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_none(&self) -> bool {
        self.handle.is_none()
    }

    /// Store a new object, releasing the previous one first
    pub fn replace(&mut self, handle: Option<H>) {
        self.release();
        self.handle = handle;
    }

    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release(self.engine.as_ref());
        }
    }
}

impl<H: EngineObject> fmt::Debug for Owned<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owned").field(&self.handle).finish()
    }
}

impl<H: EngineObject> Drop for Owned<H> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::engine::Settings;

    #[test]
    fn double_release_is_a_noop() {
        let (fake, _signals) = FakeEngine::new();
        let engine: Arc<dyn CaptureEngine> = fake.clone();

        let source = engine.create_source("wasapi_output_capture", "Desktop Audio", &Settings::new());
        let mut slot = Owned::empty(engine);
        slot.replace(source);
        assert_eq!(fake.live_objects(), 1);

        slot.release();
        slot.release();
        assert!(slot.is_none());
        assert_eq!(fake.live_objects(), 0);
        assert_eq!(fake.state().releases, 1);
    }

    #[test]
    fn drop_and_replace_release_held_objects() {
        let (fake, _signals) = FakeEngine::new();
        let engine: Arc<dyn CaptureEngine> = fake.clone();

        {
            let mut slot = Owned::empty(engine.clone());
            slot.replace(engine.create_scene("first"));
            slot.replace(engine.create_scene("second"));
            assert_eq!(fake.live_objects(), 1);
        }
        assert_eq!(fake.live_objects(), 0);
    }
}
