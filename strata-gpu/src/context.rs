//! Per GPU context sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::backend::{Backend, Viewport};
use crate::canvas::{Canvas, FrameStats};
use crate::config::Parameters;
use crate::draw_list::{Camera, RenderInfo};
use crate::error::StrataError;
use crate::render_bin::PeelMode;
use crate::tile::Screen;

/// Identity of a host GPU context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextToken(pub u64);

/// Everything cached for one GPU context: the canvas of the multi-layer
/// technique, the screen of the tiled one and the largest viewport seen.
pub struct Context<B: Backend> {
    token: ContextToken,
    canvas: Option<Canvas<B>>,
    screen: Option<Screen<B>>,
    max_size: (u32, u32),
    frames: u64,
    last_stats: FrameStats,
}

impl<B: Backend> Context<B> {
    pub fn new(token: ContextToken) -> Self {
        Self {
            token,
            canvas: None,
            screen: None,
            max_size: (0, 0),
            frames: 0,
            last_stats: FrameStats::default(),
        }
    }

    pub fn token(&self) -> ContextToken {
        self.token
    }

    pub fn canvas(&self) -> Option<&Canvas<B>> {
        self.canvas.as_ref()
    }

    pub fn screen(&self) -> Option<&Screen<B>> {
        self.screen.as_ref()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn last_stats(&self) -> FrameStats {
        self.last_stats
    }

    fn grow(&mut self, viewport: Viewport) -> (u32, u32) {
        self.max_size = (
            self.max_size.0.max(viewport.x + viewport.width),
            self.max_size.1.max(viewport.y + viewport.height),
        );
        self.max_size
    }

    /// Canvas able to render `camera`, rebuilt when the camera changed or the
    /// viewport outgrew it.
    fn canvas_for(
        &mut self,
        backend: &mut B,
        parameters: &Parameters,
        camera: &Camera,
    ) -> Result<&mut Canvas<B>, StrataError> {
        let size = self.grow(camera.viewport);
        let stale = self
            .canvas
            .as_ref()
            .is_some_and(|canvas| !canvas.is_valid_for(camera));
        if stale {
            if let Some(mut canvas) = self.canvas.take() {
                debug!("Rebuilding canvas of context {:?}", self.token);
                canvas.release(backend);
            }
        }
        match &mut self.canvas {
            Some(canvas) => Ok(canvas),
            slot => Ok(slot.insert(Canvas::new(backend, parameters, camera, size)?)),
        }
    }

    /// Runs one frame. The host state found in `info` is restored before
    /// returning, whether the frame succeeded or not.
    pub fn draw_frame(
        &mut self,
        backend: &mut B,
        info: &mut RenderInfo<B::Geometry>,
        parameters: &Parameters,
        mode: PeelMode,
        target: &B::Texture,
    ) -> Result<FrameStats, StrataError> {
        let saved = info.host.clone();
        let camera = info.camera;
        self.frames += 1;

        let result = match mode {
            PeelMode::MultiLayer => self
                .canvas_for(backend, parameters, &camera)
                .and_then(|canvas| canvas.draw(backend, info, parameters, target)),
            PeelMode::Tiled { rows, columns } => {
                let screen = self
                    .screen
                    .get_or_insert_with(|| Screen::new(rows, columns));
                screen.draw(backend, info, parameters, target)
            }
        };

        debug_assert_eq!(saved.stack, info.host.stack, "frame left the state stack changed");
        info.host = saved;
        let stats = result?;
        self.last_stats = stats;
        Ok(stats)
    }

    /// Releases every texture this context owns.
    pub fn release(&mut self, backend: &mut B) {
        if let Some(mut canvas) = self.canvas.take() {
            canvas.release(backend);
        }
        if let Some(mut screen) = self.screen.take() {
            screen.release(backend);
        }
    }
}

type SharedContext<B> = Arc<Mutex<Context<B>>>;

fn lock_context<B: Backend>(context: &SharedContext<B>) -> MutexGuard<'_, Context<B>> {
    context.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sessions of every GPU context the render bin has drawn into.
///
/// The map lock is only held to look a session up. Each session has its own
/// lock, so different contexts draw concurrently.
pub struct ContextRegistry<B: Backend> {
    contexts: Mutex<HashMap<ContextToken, SharedContext<B>>>,
}

impl<B: Backend> Default for ContextRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> ContextRegistry<B> {
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContextToken, SharedContext<B>>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, token: ContextToken) -> Option<SharedContext<B>> {
        self.lock().get(&token).cloned()
    }

    /// Runs `f` on the session of `token`, creating it first if needed.
    pub fn with_context<R>(
        &self,
        token: ContextToken,
        f: impl FnOnce(&mut Context<B>) -> Result<R, StrataError>,
    ) -> Result<R, StrataError> {
        let context = self
            .lock()
            .entry(token)
            .or_insert_with(|| {
                info!("New session for context {:?}", token);
                Arc::new(Mutex::new(Context::new(token)))
            })
            .clone();
        let mut context = lock_context(&context);
        f(&mut context)
    }

    pub fn inspect<R>(&self, token: ContextToken, f: impl FnOnce(&Context<B>) -> R) -> Option<R> {
        let context = self.get(token)?;
        let context = lock_context(&context);
        Some(f(&context))
    }

    /// Forgets a context whose GPU objects are already gone. Returns whether
    /// it had a session.
    pub fn remove(&self, token: ContextToken) -> bool {
        let removed = self.lock().remove(&token).is_some();
        if removed {
            info!("Dropped session for context {:?}", token);
        }
        removed
    }

    /// Releases and forgets every session.
    pub fn clear(&self, backend: &mut B) {
        let contexts: Vec<_> = self.lock().drain().map(|(_, context)| context).collect();
        for context in contexts {
            lock_context(&context).release(backend);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
