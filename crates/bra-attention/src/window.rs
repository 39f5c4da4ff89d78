//! Window layout transforms
//!
//! An NDHWC activation is split into an `n_win × n_win × n_win` grid of
//! windows. Window `(q, j, i)` (depth, height, width coordinates) is stored at
//! flat index `q·n_win² + j·n_win + i`. Every transform here is a pure
//! reshape/permute, so [`partition`] followed by [`reassemble`] is exact.

use bra_common::{Result, ShapeError};
use candle_core::Tensor;

const AXIS_NAMES: [&str; 3] = ["depth", "height", "width"];

/// Spatial extents of an NDHWC activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extents {
    pub depth: usize,
    pub height: usize,
    pub width: usize,
}

impl Extents {
    pub fn new(depth: usize, height: usize, width: usize) -> Self {
        Self { depth, height, width }
    }

    /// Reads the spatial extents of a rank-5 NDHWC tensor.
    pub fn of(x: &Tensor) -> Result<Self> {
        match *x.dims() {
            [_, depth, height, width, _] => Ok(Self { depth, height, width }),
            ref dims => Err(ShapeError::Rank { expected: 5, actual: dims.len() }.into()),
        }
    }

    pub fn as_array(&self) -> [usize; 3] {
        [self.depth, self.height, self.width]
    }

    pub fn volume(&self) -> usize {
        self.depth * self.height * self.width
    }

    /// Rounds every extent up to the next multiple of `n_win`.
    pub fn padded_to(&self, n_win: usize) -> Self {
        let up = |e: usize| e.div_ceil(n_win) * n_win;
        Self { depth: up(self.depth), height: up(self.height), width: up(self.width) }
    }

    pub fn check_non_empty(&self) -> Result<()> {
        for (axis, extent) in AXIS_NAMES.iter().zip(self.as_array()) {
            if extent == 0 {
                return Err(ShapeError::EmptyAxis { axis }.into());
            }
        }
        Ok(())
    }

    pub fn check_divisible(&self, n_win: usize) -> Result<()> {
        for (axis, extent) in AXIS_NAMES.iter().zip(self.as_array()) {
            if !extent.is_multiple_of(n_win) {
                return Err(ShapeError::NotDivisible { axis, extent, n_win }.into());
            }
        }
        Ok(())
    }

    /// Extents of a single window. Assumes [`Extents::check_divisible`] holds.
    pub fn window(&self, n_win: usize) -> Self {
        Self { depth: self.depth / n_win, height: self.height / n_win, width: self.width / n_win }
    }
}

/// Zero-pads depth, height and width at the trailing end up to a multiple of
/// `n_win`. Returns the padded tensor and the original extents.
pub fn pad_to_multiple(x: &Tensor, n_win: usize) -> Result<(Tensor, Extents)> {
    let original = Extents::of(x)?;
    let target = original.padded_to(n_win);
    let mut padded = x.clone();
    for (offset, (have, want)) in original.as_array().into_iter().zip(target.as_array()).enumerate()
    {
        if want > have {
            padded = padded.pad_with_zeros(offset + 1, 0, want - have)?;
        }
    }
    Ok((padded, original))
}

/// Slices an NDHWC tensor back to `extents`, undoing [`pad_to_multiple`].
pub fn crop(x: &Tensor, extents: Extents) -> Result<Tensor> {
    let current = Extents::of(x)?;
    if current == extents {
        return Ok(x.clone());
    }
    let mut out = x.clone();
    for (offset, (have, want)) in current.as_array().into_iter().zip(extents.as_array()).enumerate()
    {
        if have != want {
            out = out.narrow(offset + 1, 0, want)?;
        }
    }
    Ok(out.contiguous()?)
}

/// `(n, D, H, W, c)` → `(n, n_win³, D/n_win, H/n_win, W/n_win, c)`.
pub fn partition(x: &Tensor, n_win: usize) -> Result<Tensor> {
    let extents = Extents::of(x)?;
    extents.check_divisible(n_win)?;
    let (n, _, _, _, c) = x.dims5()?;
    let win = extents.window(n_win);
    let windows = x
        .reshape(&[n, n_win, win.depth, n_win, win.height, n_win, win.width, c])?
        .permute(vec![0, 1, 3, 5, 2, 4, 6, 7])?
        .contiguous()?
        .reshape(&[n, n_win * n_win * n_win, win.depth, win.height, win.width, c])?;
    Ok(windows)
}

/// Inverse of [`partition`]: `(n, n_win³, d, h, w, c)` → `(n, n_win·d, n_win·h, n_win·w, c)`.
pub fn reassemble(windows: &Tensor, n_win: usize) -> Result<Tensor> {
    let dims = windows.dims();
    let &[n, p3, d, h, w, c] = dims else {
        return Err(ShapeError::Rank { expected: 6, actual: dims.len() }.into());
    };
    if p3 != n_win * n_win * n_win {
        return Err(ShapeError::WindowCount { expected: n_win * n_win * n_win, actual: p3 }.into());
    }
    let x = windows
        .reshape(&[n, n_win, n_win, n_win, d, h, w, c])?
        .permute(vec![0, 1, 4, 2, 5, 3, 6, 7])?
        .contiguous()?
        .reshape(&[n, n_win * d, n_win * h, n_win * w, c])?;
    Ok(x)
}
