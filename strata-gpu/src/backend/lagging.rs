//! Software rendering whose occlusion results arrive several polls late,
//! in a different order than they were issued.

use crate::backend::{
    Backend, PassUniforms, QueryBackend, QueryLedger, ScenePass, ScreenPass, ShaderSet,
    SoftwareBackend, SoftwareGeometry, SoftwareTexture, TextureDesc, TextureFormat, Viewport,
};
use crate::draw_list::StateSetId;
use crate::error::StrataError;
use crate::types::SceneVertex;

struct Delivery {
    query: u32,
    generation: u64,
    samples: u64,
    polls: u32,
}

pub(crate) struct LaggingBackend {
    inner: SoftwareBackend,
    counter: Option<usize>,
    ledger: QueryLedger,
    active: Option<(u32, u64)>,
    in_flight: Vec<Delivery>,
    lag: u32,
    issued: u32,
    stale: usize,
}

impl LaggingBackend {
    /// Results take between `lag` and `lag + 2` polls to arrive.
    pub(crate) fn new(lag: u32) -> Self {
        Self {
            inner: SoftwareBackend::new(),
            counter: None,
            ledger: QueryLedger::new(1024),
            active: None,
            in_flight: Vec::new(),
            lag,
            issued: 0,
            stale: 0,
        }
    }

    pub(crate) fn inner(&self) -> &SoftwareBackend {
        &self.inner
    }

    pub(crate) fn inner_mut(&mut self) -> &mut SoftwareBackend {
        &mut self.inner
    }

    /// Results that arrived after their query was issued again.
    pub(crate) fn stale_results(&self) -> usize {
        self.stale
    }

    pub(crate) fn live_queries(&self) -> usize {
        self.ledger.live()
    }

    fn deliver(&mut self, delivery: Delivery) {
        if !self
            .ledger
            .accept(delivery.query, delivery.generation, delivery.samples)
        {
            self.stale += 1;
        }
    }

    fn tick(&mut self) {
        let mut index = 0;
        while index < self.in_flight.len() {
            let delivery = &mut self.in_flight[index];
            delivery.polls = delivery.polls.saturating_sub(1);
            if delivery.polls == 0 {
                let delivery = self.in_flight.remove(index);
                self.deliver(delivery);
            } else {
                index += 1;
            }
        }
    }
}

impl QueryBackend for LaggingBackend {
    type Query = u32;

    fn create_query(&mut self) -> Result<u32, StrataError> {
        self.ledger.allocate()
    }

    fn release_query(&mut self, query: u32) {
        self.ledger.release(query);
    }

    fn begin_query(&mut self, query: u32, any_samples: bool) {
        self.end_query();
        let counter = match self.counter {
            Some(counter) => counter,
            None => {
                let counter = self.inner.create_query().unwrap();
                self.counter = Some(counter);
                counter
            }
        };
        let generation = self.ledger.issue(query, any_samples);
        self.inner.begin_query(counter, false);
        self.active = Some((query, generation));
    }

    fn end_query(&mut self) {
        let (Some((query, generation)), Some(counter)) = (self.active.take(), self.counter) else {
            return;
        };
        self.inner.end_query();
        let samples = self.inner.query_result(counter).unwrap();
        self.in_flight.push(Delivery {
            query,
            generation,
            samples,
            polls: self.lag + self.issued % 3,
        });
        self.issued += 1;
    }

    fn query_available(&mut self, query: u32) -> bool {
        self.tick();
        self.ledger.result(query).is_some()
    }

    fn query_result(&mut self, query: u32) -> Result<u64, StrataError> {
        if let Some(samples) = self.ledger.result(query) {
            return Ok(samples);
        }
        let generation = self.ledger.generation(query);
        if let Some(index) = self
            .in_flight
            .iter()
            .position(|d| d.query == query && Some(d.generation) == generation)
        {
            let delivery = self.in_flight.remove(index);
            self.deliver(delivery);
        }
        Ok(self.ledger.result(query).unwrap_or(0))
    }
}

impl Backend for LaggingBackend {
    type Texture = SoftwareTexture;
    type Geometry = SoftwareGeometry;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<SoftwareTexture, StrataError> {
        self.inner.create_texture(desc)
    }

    fn release_texture(&mut self, texture: SoftwareTexture) {
        self.inner.release_texture(texture);
    }

    fn texture_size(&self, texture: &SoftwareTexture) -> (u32, u32) {
        self.inner.texture_size(texture)
    }

    fn texture_format(&self, texture: &SoftwareTexture) -> TextureFormat {
        self.inner.texture_format(texture)
    }

    fn read_texture(&mut self, texture: &SoftwareTexture) -> Result<Vec<[f32; 4]>, StrataError> {
        self.inner.read_texture(texture)
    }

    fn create_geometry(&mut self, vertices: &[SceneVertex]) -> SoftwareGeometry {
        self.inner.create_geometry(vertices)
    }

    fn set_extra_shaders(&mut self, state: StateSetId, shaders: &ShaderSet) {
        self.inner.set_extra_shaders(state, shaders);
    }

    fn clear(&mut self, targets: &[SoftwareTexture], value: [f32; 4], viewport: Viewport) {
        self.inner.clear(targets, value, viewport);
    }

    fn begin_scene(
        &mut self,
        pass: &ScenePass<'_, SoftwareTexture>,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError> {
        self.inner.begin_scene(pass, uniforms)
    }

    fn draw(&mut self, geometry: &SoftwareGeometry, state: StateSetId) {
        self.inner.draw(geometry, state);
    }

    fn draw_vertices(&mut self, vertices: &[SceneVertex], state: StateSetId) {
        self.inner.draw_vertices(vertices, state);
    }

    fn end_scene(&mut self) -> Result<(), StrataError> {
        self.end_query();
        self.inner.end_scene()
    }

    fn screen_pass(
        &mut self,
        pass: &ScreenPass<'_, SoftwareTexture>,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError> {
        self.inner.screen_pass(pass, uniforms)
    }
}
