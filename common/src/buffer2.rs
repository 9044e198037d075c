use std::collections::TryReserveError;
use std::ops::{Deref, Index, IndexMut};

/// Row-major 2-D pixel buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer2<T> {
    pixels: Vec<T>,
    width: usize,
    height: usize,
}

impl<T> Buffer2<T> {
    pub fn new(width: usize, height: usize, pixels: Vec<T>) -> Self {
        assert_eq!(
            pixels.len(),
            width * height,
            "pixels length must equal width * height"
        );
        Self {
            pixels,
            width,
            height,
        }
    }

    /// Builds a buffer by evaluating `f(x, y)` for every pixel in row order.
    pub fn from_fn<F>(width: usize, height: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> T,
    {
        let mut pixels = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self {
            pixels,
            width,
            height,
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> &T {
        debug_assert!(x < self.width && y < self.height);
        &self.pixels[y * self.width + x]
    }

    #[inline]
    pub fn get_mut(&mut self, x: usize, y: usize) -> &mut T {
        debug_assert!(x < self.width && y < self.height);
        &mut self.pixels[y * self.width + x]
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn pixels(&self) -> &[T] {
        &self.pixels
    }

    #[inline]
    pub fn pixels_mut(&mut self) -> &mut [T] {
        &mut self.pixels
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        let start = y * self.width;
        &self.pixels[start..start + self.width]
    }

    #[inline]
    pub fn into_vec(self) -> Vec<T> {
        self.pixels
    }
}

impl<T: Clone> Buffer2<T> {
    pub fn new_filled(width: usize, height: usize, value: T) -> Self {
        Self {
            pixels: vec![value; width * height],
            width,
            height,
        }
    }

    /// Like [`Buffer2::new_filled`] but reports allocation failure instead of aborting.
    pub fn try_new_filled(width: usize, height: usize, value: T) -> Result<Self, TryReserveError> {
        let len = width * height;
        let mut pixels = Vec::new();
        pixels.try_reserve_exact(len)?;
        pixels.resize(len, value);
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    /// Copies the `(2 * half_size + 1)²` square centered on `(cx, cy)`.
    ///
    /// Returns `None` when the square does not fit inside the buffer.
    pub fn patch(&self, cx: usize, cy: usize, half_size: usize) -> Option<Self> {
        if cx < half_size
            || cy < half_size
            || cx + half_size >= self.width
            || cy + half_size >= self.height
        {
            return None;
        }

        let side = 2 * half_size + 1;
        let mut pixels = Vec::with_capacity(side * side);
        for y in (cy - half_size)..=(cy + half_size) {
            let start = y * self.width + cx - half_size;
            pixels.extend_from_slice(&self.pixels[start..start + side]);
        }

        Some(Self {
            pixels,
            width: side,
            height: side,
        })
    }
}

impl<T: Default + Clone> Buffer2<T> {
    pub fn new_default(width: usize, height: usize) -> Self {
        Self::new_filled(width, height, T::default())
    }
}

impl<T> Index<(usize, usize)> for Buffer2<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        &self.pixels[y * self.width + x]
    }
}

impl<T> IndexMut<(usize, usize)> for Buffer2<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut Self::Output {
        &mut self.pixels[y * self.width + x]
    }
}

impl<T> Deref for Buffer2<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.pixels
    }
}
