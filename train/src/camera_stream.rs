//! Camera sampling policies.
//!
//! Training draws one camera per iteration from a [`CameraStream`]. Which
//! policy is used is decided once by [`build_camera_stream`]:
//! - [`PoolStream`] holds decoded cameras and draws without replacement from
//!   a pool that is refilled once exhausted.
//! - [`CyclicStream`] walks an index sequence over a [`CameraLoader`] and
//!   decodes each camera just before handing it out.
//!
//! Both visit every camera exactly once per epoch.

use std::sync::Arc;

use gs_core::Camera;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::DatasetMode;
use crate::{Error, Result};

pub trait CameraStream: Send {
    fn next_camera(&mut self) -> Result<Arc<Camera>>;

    /// Number of distinct cameras per epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completed passes over the camera set.
    fn epoch(&self) -> usize;
}

/// Lazy source of cameras, addressed by index.
pub trait CameraLoader: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load(&mut self, index: usize) -> Result<Arc<Camera>>;
}

impl CameraLoader for Vec<Arc<Camera>> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn load(&mut self, index: usize) -> Result<Arc<Camera>> {
        self.get(index)
            .cloned()
            .ok_or_else(|| Error::Dataset(format!("camera index {index} out of range")))
    }
}

pub struct PoolStream {
    cameras: Vec<Arc<Camera>>,
    pool: Vec<usize>,
    rng: StdRng,
    epoch: usize,
}

impl PoolStream {
    pub fn new(cameras: Vec<Arc<Camera>>, seed: u64) -> Result<Self> {
        if cameras.is_empty() {
            return Err(Error::EmptyCameraSet("no training cameras to draw from".into()));
        }
        let pool = (0..cameras.len()).collect();
        Ok(Self {
            cameras,
            pool,
            rng: StdRng::seed_from_u64(seed),
            epoch: 0,
        })
    }

    /// Cameras left before the pool is refilled.
    pub fn remaining(&self) -> usize {
        self.pool.len()
    }
}

impl CameraStream for PoolStream {
    fn next_camera(&mut self) -> Result<Arc<Camera>> {
        if self.pool.is_empty() {
            self.pool = (0..self.cameras.len()).collect();
            self.epoch += 1;
        }
        let slot = self.rng.gen_range(0..self.pool.len());
        let index = self.pool.swap_remove(slot);
        Ok(Arc::clone(&self.cameras[index]))
    }

    fn len(&self) -> usize {
        self.cameras.len()
    }

    fn epoch(&self) -> usize {
        self.epoch
    }
}

pub struct CyclicStream<L: CameraLoader> {
    loader: L,
    order: Vec<usize>,
    cursor: usize,
    shuffle: bool,
    rng: StdRng,
    epoch: usize,
}

impl<L: CameraLoader> CyclicStream<L> {
    pub fn new(loader: L, shuffle: bool, seed: u64) -> Result<Self> {
        if loader.is_empty() {
            return Err(Error::EmptyCameraSet("camera loader is empty".into()));
        }
        let mut stream = Self {
            order: (0..loader.len()).collect(),
            loader,
            cursor: 0,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            epoch: 0,
        };
        stream.reorder();
        Ok(stream)
    }

    fn reorder(&mut self) {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }
}

impl<L: CameraLoader> CameraStream for CyclicStream<L> {
    fn next_camera(&mut self) -> Result<Arc<Camera>> {
        if self.cursor == self.order.len() {
            self.cursor = 0;
            self.epoch += 1;
            self.reorder();
        }
        let index = self.order[self.cursor];
        self.cursor += 1;
        self.loader.load(index)
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn epoch(&self) -> usize {
        self.epoch
    }
}

/// Picks the sampling policy for a dataset mode.
///
/// `Preloaded` decodes every camera through the loader up front.
pub fn build_camera_stream<L>(mode: DatasetMode, mut loader: L, seed: u64) -> Result<Box<dyn CameraStream>>
where
    L: CameraLoader + 'static,
{
    match mode {
        DatasetMode::Preloaded => {
            let cameras = (0..loader.len())
                .map(|i| loader.load(i))
                .collect::<Result<Vec<_>>>()?;
            Ok(Box::new(PoolStream::new(cameras, seed)?))
        }
        DatasetMode::Streamed => Ok(Box::new(CyclicStream::new(loader, true, seed)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gs_core::Image;
    use nalgebra::{Matrix3, Vector3};

    fn cameras(n: usize) -> Vec<Arc<Camera>> {
        (0..n)
            .map(|i| {
                Arc::new(
                    Camera::new(
                        i,
                        format!("cam_{i}"),
                        Matrix3::identity(),
                        Vector3::zeros(),
                        1.0,
                        1.0,
                        Image::new(2, 2, 3),
                        None,
                        Vector3::zeros(),
                    )
                    .unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_empty_sets_rejected() {
        assert!(matches!(PoolStream::new(vec![], 0), Err(Error::EmptyCameraSet(_))));
        assert!(matches!(
            CyclicStream::new(Vec::<Arc<Camera>>::new(), false, 0),
            Err(Error::EmptyCameraSet(_))
        ));
    }

    #[test]
    fn test_cyclic_order_without_shuffle() {
        let mut stream = CyclicStream::new(cameras(3), false, 0).unwrap();
        let uids: Vec<usize> = (0..7).map(|_| stream.next_camera().unwrap().uid).collect();
        assert_eq!(uids, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(stream.epoch(), 2);
    }

    #[test]
    fn test_streamed_mode_is_cyclic() {
        let mut stream = build_camera_stream(DatasetMode::Streamed, cameras(4), 9).unwrap();
        let mut seen: Vec<usize> = (0..4).map(|_| stream.next_camera().unwrap().uid).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
