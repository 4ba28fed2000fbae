// ABOUTME: Render-surface seam between a terminal session and the UI
// The session tracks the surface without keeping it alive; resize and
// keystroke streams replace DOM observers

use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, watch};

/// The render target a terminal session attaches to. Sessions hold only a
/// weak reference: the surface's lifetime belongs to the UI.
pub trait TerminalSurface: Send + Sync {
    /// Current size in character cells.
    fn size(&self) -> (u16, u16);

    /// Watch channel that yields the size on every surface resize.
    fn resized(&self) -> watch::Receiver<(u16, u16)>;

    /// Keystroke chunks produced by the surface.
    fn input(&self) -> broadcast::Receiver<String>;
}

/// Surface with programmatic size and input, for tests and headless
/// embedding.
pub struct ScriptedSurface {
    size: RwLock<(u16, u16)>,
    resize_tx: watch::Sender<(u16, u16)>,
    input_tx: broadcast::Sender<String>,
}

impl ScriptedSurface {
    pub fn new(cols: u16, rows: u16) -> Arc<Self> {
        let (resize_tx, _) = watch::channel((cols, rows));
        let (input_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            size: RwLock::new((cols, rows)),
            resize_tx,
            input_tx,
        })
    }

    pub fn set_size(&self, cols: u16, rows: u16) {
        *self.size.write().expect("surface size lock poisoned") = (cols, rows);
        let _ = self.resize_tx.send((cols, rows));
    }

    pub fn type_text(&self, text: impl Into<String>) {
        let _ = self.input_tx.send(text.into());
    }
}

impl TerminalSurface for ScriptedSurface {
    fn size(&self) -> (u16, u16) {
        *self.size.read().expect("surface size lock poisoned")
    }

    fn resized(&self) -> watch::Receiver<(u16, u16)> {
        self.resize_tx.subscribe()
    }

    fn input(&self) -> broadcast::Receiver<String> {
        self.input_tx.subscribe()
    }
}
