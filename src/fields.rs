//! Dense rectangular containers for per-element data.
//!
//! Worksets and cells index everything by a leading element axis; these
//! containers keep the storage flat and hand out disjoint per-element rows so
//! the element loop can run as a parallel for without atomics.

use std::ops::{Index, IndexMut};

use rayon::prelude::*;

#[derive(Debug, Clone)]
pub struct Field2<T> {
    nrows: usize,
    ncols: usize,
    data: Vec<T>,
}

impl<T: Clone> Field2<T> {
    pub fn from_elem(nrows: usize, ncols: usize, value: T) -> Self {
        Self {
            nrows,
            ncols,
            data: vec![value; nrows * ncols],
        }
    }

    pub fn fill(&mut self, value: T) {
        for v in &mut self.data {
            *v = value.clone();
        }
    }
}

impl<T> Field2<T> {
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn row(&self, e: usize) -> &[T] {
        &self.data[e * self.ncols..(e + 1) * self.ncols]
    }

    pub fn row_mut(&mut self, e: usize) -> &mut [T] {
        &mut self.data[e * self.ncols..(e + 1) * self.ncols]
    }

    pub fn rows_mut(&mut self) -> std::slice::ChunksMut<'_, T> {
        self.data.chunks_mut(self.ncols)
    }

    pub fn par_rows_mut(&mut self) -> rayon::slice::ChunksMut<'_, T>
    where
        T: Send,
    {
        self.data.par_chunks_mut(self.ncols)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

impl<T> Index<(usize, usize)> for Field2<T> {
    type Output = T;

    #[inline]
    fn index(&self, (e, k): (usize, usize)) -> &T {
        debug_assert!(e < self.nrows && k < self.ncols);
        &self.data[e * self.ncols + k]
    }
}

impl<T> IndexMut<(usize, usize)> for Field2<T> {
    #[inline]
    fn index_mut(&mut self, (e, k): (usize, usize)) -> &mut T {
        debug_assert!(e < self.nrows && k < self.ncols);
        &mut self.data[e * self.ncols + k]
    }
}

#[derive(Debug, Clone)]
pub struct Field3<T> {
    d0: usize,
    d1: usize,
    d2: usize,
    data: Vec<T>,
}

impl<T: Clone> Field3<T> {
    pub fn from_elem(d0: usize, d1: usize, d2: usize, value: T) -> Self {
        Self {
            d0,
            d1,
            d2,
            data: vec![value; d0 * d1 * d2],
        }
    }

    pub fn fill(&mut self, value: T) {
        for v in &mut self.data {
            *v = value.clone();
        }
    }
}

impl<T> Field3<T> {
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.d0, self.d1, self.d2)
    }

    /// The `(a, b, ..)` slice over the trailing axis.
    pub fn lane(&self, a: usize, b: usize) -> &[T] {
        let start = (a * self.d1 + b) * self.d2;
        &self.data[start..start + self.d2]
    }

    pub fn lane_mut(&mut self, a: usize, b: usize) -> &mut [T] {
        let start = (a * self.d1 + b) * self.d2;
        &mut self.data[start..start + self.d2]
    }

    /// Per-leading-index blocks of size `d1 * d2`, for parallel element loops.
    pub fn par_blocks_mut(&mut self) -> rayon::slice::ChunksMut<'_, T>
    where
        T: Send,
    {
        self.data.par_chunks_mut(self.d1 * self.d2)
    }

    pub fn block(&self, a: usize) -> &[T] {
        let span = self.d1 * self.d2;
        &self.data[a * span..(a + 1) * span]
    }
}

impl<T> Index<(usize, usize, usize)> for Field3<T> {
    type Output = T;

    #[inline]
    fn index(&self, (a, b, c): (usize, usize, usize)) -> &T {
        debug_assert!(a < self.d0 && b < self.d1 && c < self.d2);
        &self.data[(a * self.d1 + b) * self.d2 + c]
    }
}

impl<T> IndexMut<(usize, usize, usize)> for Field3<T> {
    #[inline]
    fn index_mut(&mut self, (a, b, c): (usize, usize, usize)) -> &mut T {
        debug_assert!(a < self.d0 && b < self.d1 && c < self.d2);
        &mut self.data[(a * self.d1 + b) * self.d2 + c]
    }
}

#[derive(Debug, Clone)]
pub struct Field4<T> {
    d0: usize,
    d1: usize,
    d2: usize,
    d3: usize,
    data: Vec<T>,
}

impl<T: Clone> Field4<T> {
    pub fn from_elem(d0: usize, d1: usize, d2: usize, d3: usize, value: T) -> Self {
        Self {
            d0,
            d1,
            d2,
            d3,
            data: vec![value; d0 * d1 * d2 * d3],
        }
    }

    pub fn fill(&mut self, value: T) {
        for v in &mut self.data {
            *v = value.clone();
        }
    }
}

impl<T> Field4<T> {
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (self.d0, self.d1, self.d2, self.d3)
    }

    /// The `(a, b, c, ..)` slice over the trailing axis.
    pub fn lane(&self, a: usize, b: usize, c: usize) -> &[T] {
        let start = ((a * self.d1 + b) * self.d2 + c) * self.d3;
        &self.data[start..start + self.d3]
    }

    pub fn lane_mut(&mut self, a: usize, b: usize, c: usize) -> &mut [T] {
        let start = ((a * self.d1 + b) * self.d2 + c) * self.d3;
        &mut self.data[start..start + self.d3]
    }
}

impl<T> Index<(usize, usize, usize, usize)> for Field4<T> {
    type Output = T;

    #[inline]
    fn index(&self, (a, b, c, d): (usize, usize, usize, usize)) -> &T {
        debug_assert!(a < self.d0 && b < self.d1 && c < self.d2 && d < self.d3);
        &self.data[((a * self.d1 + b) * self.d2 + c) * self.d3 + d]
    }
}

impl<T> IndexMut<(usize, usize, usize, usize)> for Field4<T> {
    #[inline]
    fn index_mut(&mut self, (a, b, c, d): (usize, usize, usize, usize)) -> &mut T {
        debug_assert!(a < self.d0 && b < self.d1 && c < self.d2 && d < self.d3);
        &mut self.data[((a * self.d1 + b) * self.d2 + c) * self.d3 + d]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field2_rows_are_disjoint_and_ordered() {
        let mut f = Field2::from_elem(3, 2, 0.0f64);
        for (e, row) in f.rows_mut().enumerate() {
            for (k, v) in row.iter_mut().enumerate() {
                *v = (e * 10 + k) as f64;
            }
        }
        assert_eq!(f[(2, 1)], 21.0);
        assert_eq!(f.row(1), &[10.0, 11.0]);
    }

    #[test]
    fn field4_lane_matches_index() {
        let mut f = Field4::from_elem(2, 2, 2, 3, 0i32);
        f[(1, 0, 1, 2)] = 42;
        assert_eq!(f.lane(1, 0, 1), &[0, 0, 42]);
    }
}
