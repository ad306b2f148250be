//! Reusable render targets, keyed by pixel format.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::backend::{Backend, TextureDesc, TextureFormat};
use crate::error::StrataError;

pub struct ResourcePool<T> {
    textures: HashMap<TextureFormat, VecDeque<T>>,
}

impl<T> Default for ResourcePool<T> {
    fn default() -> Self {
        Self {
            textures: HashMap::new(),
        }
    }
}

impl<T> ResourcePool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pooled textures of `format`.
    pub fn available(&self, format: TextureFormat) -> usize {
        self.textures.get(&format).map_or(0, VecDeque::len)
    }

    /// Takes exactly `count` textures of `format` at least `width` x `height`
    /// in size, or nothing.
    ///
    /// Pooled textures of `format` smaller than requested are released.
    pub fn extract<B>(
        &mut self,
        backend: &mut B,
        format: TextureFormat,
        count: usize,
        width: u32,
        height: u32,
    ) -> Option<Vec<T>>
    where
        B: Backend<Texture = T>,
    {
        let textures = self.textures.get_mut(&format)?;
        let (kept, small): (VecDeque<T>, VecDeque<T>) =
            textures.drain(..).partition(|texture| {
                let (w, h) = backend.texture_size(texture);
                w >= width && h >= height
            });
        *textures = kept;
        if !small.is_empty() {
            debug!("Dropping {} undersized {:?} textures", small.len(), format);
        }
        for texture in small {
            backend.release_texture(texture);
        }
        if textures.len() < count {
            return None;
        }
        Some(textures.drain(..count).collect())
    }

    /// Returns textures to the pool. They are handed out again first.
    pub fn give_back(&mut self, format: TextureFormat, textures: impl IntoIterator<Item = T>) {
        let pooled = self.textures.entry(format).or_default();
        for texture in textures {
            pooled.push_front(texture);
        }
    }

    /// Creates textures until `count` of `format` are pooled.
    pub fn top_up<B>(
        &mut self,
        backend: &mut B,
        format: TextureFormat,
        count: usize,
        width: u32,
        height: u32,
    ) -> Result<(), StrataError>
    where
        B: Backend<Texture = T>,
    {
        let pooled = self.textures.entry(format).or_default();
        while pooled.len() < count {
            let desc = TextureDesc::new("strata_pool", width, height, format);
            pooled.push_back(backend.create_texture(&desc)?);
        }
        Ok(())
    }

    /// Releases every pooled texture.
    pub fn clear<B>(&mut self, backend: &mut B)
    where
        B: Backend<Texture = T>,
    {
        for (_, textures) in self.textures.drain() {
            for texture in textures {
                backend.release_texture(texture);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;

    #[test]
    fn test_extract_from_empty_pool_fails() {
        let mut backend = SoftwareBackend::new();
        let mut pool = ResourcePool::new();
        assert!(pool
            .extract(&mut backend, TextureFormat::R32Float, 2, 4, 4)
            .is_none());
    }

    #[test]
    fn test_round_trip_returns_same_format_and_size() {
        let mut backend = SoftwareBackend::new();
        let mut pool = ResourcePool::new();
        pool.top_up(&mut backend, TextureFormat::R32Float, 2, 8, 8)
            .unwrap();
        pool.top_up(&mut backend, TextureFormat::Rgba32Float, 2, 8, 8)
            .unwrap();

        let depth = pool
            .extract(&mut backend, TextureFormat::R32Float, 2, 8, 8)
            .unwrap();
        assert_eq!(pool.available(TextureFormat::R32Float), 0);
        pool.give_back(TextureFormat::R32Float, depth.clone());

        let again = pool
            .extract(&mut backend, TextureFormat::R32Float, 2, 6, 6)
            .unwrap();
        for texture in &again {
            assert_eq!(backend.texture_format(texture), TextureFormat::R32Float);
            let (w, h) = backend.texture_size(texture);
            assert!(w >= 6 && h >= 6);
        }
        assert_eq!(pool.available(TextureFormat::Rgba32Float), 2);
    }

    #[test]
    fn test_undersized_textures_are_released() {
        let mut backend = SoftwareBackend::new();
        let mut pool = ResourcePool::new();
        pool.top_up(&mut backend, TextureFormat::R32Float, 2, 4, 4)
            .unwrap();
        assert_eq!(backend.texture_count(), 2);

        assert!(pool
            .extract(&mut backend, TextureFormat::R32Float, 1, 8, 8)
            .is_none());
        assert_eq!(pool.available(TextureFormat::R32Float), 0);
        assert_eq!(backend.texture_count(), 0);
    }

    #[test]
    fn test_partial_extraction_takes_nothing() {
        let mut backend = SoftwareBackend::new();
        let mut pool = ResourcePool::new();
        pool.top_up(&mut backend, TextureFormat::R32Float, 1, 4, 4)
            .unwrap();
        assert!(pool
            .extract(&mut backend, TextureFormat::R32Float, 2, 4, 4)
            .is_none());
        assert_eq!(pool.available(TextureFormat::R32Float), 1);
    }
}
