//! 骨缝模板与 bregma/lambda 标记模板.

use std::path::{Path, PathBuf};

use log::debug;
use ndarray::{Array2, ArrayView2};

use super::{LandmarkError, LandmarkResult};
use crate::consts::templates::{BREGMA, LAMBDA, SUTURE};

/// 一组模板. 三幅图像位于同一参考坐标系下.
#[derive(Clone, Debug)]
pub struct SutureTemplates {
    suture: Array2<f32>,
    bregma: Array2<f32>,
    lambda: Array2<f32>,
}

/// 以灰度方式读取 png, 存为 `(y, x)` 数组.
fn read_gray(path: PathBuf) -> LandmarkResult<Array2<f32>> {
    let img = image::open(&path)
        .map_err(|source| LandmarkError::Template {
            path: path.clone(),
            source,
        })?
        .to_luma8();
    let (w, h) = img.dimensions();
    debug!("Loaded template {} of shape ({h}, {w})", path.display());
    Ok(Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
        img.get_pixel(x as u32, y as u32).0[0] as f32
    }))
}

impl SutureTemplates {
    /// 从目录 `dir` 中按默认文件名读取三幅模板.
    pub fn open<P: AsRef<Path>>(dir: P) -> LandmarkResult<Self> {
        let dir = dir.as_ref();
        Self::from_arrays(
            read_gray(dir.join(SUTURE))?,
            read_gray(dir.join(BREGMA))?,
            read_gray(dir.join(LAMBDA))?,
        )
    }

    /// 由已有数组构造. 标记模板不能没有前景像素.
    pub fn from_arrays(
        suture: Array2<f32>,
        bregma: Array2<f32>,
        lambda: Array2<f32>,
    ) -> LandmarkResult<Self> {
        for (name, marker) in [("bregma", &bregma), ("lambda", &lambda)] {
            if !marker.iter().any(|v| *v > 0.0) {
                return Err(LandmarkError::EmptyTemplate(name));
            }
        }
        if suture.is_empty() {
            return Err(LandmarkError::EmptyTemplate("suture"));
        }
        Ok(Self {
            suture,
            bregma,
            lambda,
        })
    }

    /// 骨缝模板.
    #[inline]
    pub fn suture(&self) -> ArrayView2<'_, f32> {
        self.suture.view()
    }

    /// Bregma 标记模板.
    #[inline]
    pub fn bregma(&self) -> ArrayView2<'_, f32> {
        self.bregma.view()
    }

    /// Lambda 标记模板.
    #[inline]
    pub fn lambda(&self) -> ArrayView2<'_, f32> {
        self.lambda.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_marker_is_rejected() {
        let suture = Array2::<f32>::ones((4, 4));
        let mut bregma = Array2::<f32>::zeros((4, 4));
        bregma[(1, 1)] = 255.0;
        let lambda = Array2::<f32>::zeros((4, 4));
        let err = SutureTemplates::from_arrays(suture, bregma, lambda).unwrap_err();
        assert!(matches!(err, LandmarkError::EmptyTemplate("lambda")));
    }

    #[test]
    fn test_missing_directory_reports_path() {
        let err = SutureTemplates::open("/definitely/not/here").unwrap_err();
        match err {
            LandmarkError::Template { path, .. } => assert!(path.ends_with(SUTURE)),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
