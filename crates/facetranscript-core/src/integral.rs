//! Summed-area tables over a grayscale image.

use image::GrayImage;

/// Integral and squared-integral images with a zero first row and column,
/// so `sum[(y + 1) * stride + (x + 1)]` covers pixels `[0..=x] × [0..=y]`.
pub struct IntegralImage {
    width: u32,
    height: u32,
    stride: usize,
    sum: Vec<u64>,
    sqsum: Vec<u64>,
}

impl IntegralImage {
    pub fn new(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        let stride = width as usize + 1;
        let mut sum = vec![0u64; stride * (height as usize + 1)];
        let mut sqsum = vec![0u64; sum.len()];

        for (y, row) in image.as_raw().chunks_exact(width.max(1) as usize).enumerate() {
            let mut row_sum = 0u64;
            let mut row_sqsum = 0u64;
            for (x, &px) in row.iter().enumerate() {
                let v = px as u64;
                row_sum += v;
                row_sqsum += v * v;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row_sum;
                sqsum[idx] = sqsum[idx - stride] + row_sqsum;
            }
        }

        Self {
            width,
            height,
            stride,
            sum,
            sqsum,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Sum of pixels in the `w × h` rectangle at `(x, y)`.
    ///
    /// The rectangle must lie within the image.
    #[inline]
    pub fn rect_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::lookup(&self.sum, self.stride, x, y, w, h)
    }

    /// Sum of squared pixels in the `w × h` rectangle at `(x, y)`.
    #[inline]
    pub fn rect_sqsum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::lookup(&self.sqsum, self.stride, x, y, w, h)
    }

    #[inline]
    fn lookup(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y0 * stride + x1]
            - table[y1 * stride + x0]
    }
}
