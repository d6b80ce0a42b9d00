//! Rolling face-count trend

use std::collections::VecDeque;

use serde::Serialize;

/// Summary of the face counts currently in the window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendSnapshot {
    pub average: f64,
    pub min: usize,
    pub max: usize,
    pub samples: usize,
}

/// Face counts of the last `window` processed frames
#[derive(Debug, Clone)]
pub struct FaceCountTrend {
    counts: VecDeque<usize>,
    window: usize,
}

impl FaceCountTrend {
    /// A zero window is treated as one
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            counts: VecDeque::with_capacity(window),
            window,
        }
    }

    pub fn push(&mut self, faces: usize) {
        if self.counts.len() == self.window {
            self.counts.pop_front();
        }
        self.counts.push_back(faces);
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// `None` until the first frame has been pushed
    pub fn snapshot(&self) -> Option<TrendSnapshot> {
        let min = *self.counts.iter().min()?;
        let max = *self.counts.iter().max()?;
        let total: usize = self.counts.iter().sum();
        Some(TrendSnapshot {
            average: total as f64 / self.counts.len() as f64,
            min,
            max,
            samples: self.counts.len(),
        })
    }
}
