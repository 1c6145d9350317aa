//! 相似性度量. 对每个采样点同时给出损失值和损失关于浮动图像强度的导数.

use super::config::Loss;

/// 对数运算的平滑项, 避免 `ln(0)`.
const EPS: f64 = 1e-12;

/// 强度区间 `[min, max]`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    /// 统计一组强度的区间. 空集合返回 `[0, 1]`.
    pub fn of<I: IntoIterator<Item = f64>>(it: I) -> Self {
        let (min, max) = it
            .into_iter()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
        if min.is_finite() {
            Self { min, max }
        } else {
            Self { min: 0.0, max: 1.0 }
        }
    }

    #[inline]
    fn width(&self) -> f64 {
        let w = self.max - self.min;
        if w > 0.0 {
            w
        } else {
            1.0
        }
    }

    /// 把 `v` 映射为 `[0, bins - 1]` 上的连续位置.
    #[inline]
    fn position(&self, v: f64, bins: usize) -> f64 {
        ((v - self.min) / self.width() * (bins - 1) as f64).clamp(0.0, (bins - 1) as f64)
    }
}

/// 度量求值器. 强度区间在配准开始时确定, 之后不再改变.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Metric {
    pub loss: Loss,
    pub fixed_range: Range,
    pub moving_range: Range,
}

impl Metric {
    /// 返回 `(损失, 每个采样点的 dloss/dm)`.
    pub fn evaluate(&self, fixed: &[f64], moving: &[f64]) -> (f64, Vec<f64>) {
        debug_assert_eq!(fixed.len(), moving.len());
        if fixed.is_empty() {
            return (f64::NAN, vec![]);
        }
        match self.loss {
            Loss::MeanSquares => mean_squares(fixed, moving),
            Loss::MutualInformation { bins } => self.mutual_information(fixed, moving, bins),
        }
    }

    fn mutual_information(&self, fixed: &[f64], moving: &[f64], bins: usize) -> (f64, Vec<f64>) {
        let n = fixed.len() as f64;
        let a_bins: Vec<usize> = fixed
            .iter()
            .map(|f| self.fixed_range.position(*f, bins).round() as usize)
            .collect();
        let b_pos: Vec<f64> = moving
            .iter()
            .map(|m| self.moving_range.position(*m, bins))
            .collect();

        // 浮动图像一侧使用线性分桶, 使联合分布对强度连续.
        let mut joint = vec![0.0; bins * bins];
        let mut pb = vec![0.0; bins];
        let mut pa = vec![0.0; bins];
        for (&a, &u) in a_bins.iter().zip(b_pos.iter()) {
            let b0 = u.floor() as usize;
            let t = u - b0 as f64;
            pa[a] += 1.0 / n;
            joint[a * bins + b0] += (1.0 - t) / n;
            pb[b0] += (1.0 - t) / n;
            if b0 + 1 < bins {
                joint[a * bins + b0 + 1] += t / n;
                pb[b0 + 1] += t / n;
            }
        }

        let mut mi = 0.0;
        for a in 0..bins {
            for b in 0..bins {
                let p = joint[a * bins + b];
                if p > 0.0 {
                    mi += p * (p / (pa[a] * pb[b])).ln();
                }
            }
        }

        let du_dm = (bins - 1) as f64 / self.moving_range.width();
        let grad = a_bins
            .iter()
            .zip(b_pos.iter())
            .map(|(&a, &u)| {
                let b0 = u.floor() as usize;
                if b0 + 1 >= bins {
                    return 0.0;
                }
                let ln = |v: f64| (v + EPS).ln();
                let dmi_du = (ln(joint[a * bins + b0 + 1]) - ln(joint[a * bins + b0])
                    - ln(pb[b0 + 1])
                    + ln(pb[b0]))
                    / n;
                -dmi_du * du_dm
            })
            .collect();

        (-mi, grad)
    }
}

/// 均方误差.
fn mean_squares(fixed: &[f64], moving: &[f64]) -> (f64, Vec<f64>) {
    let n = fixed.len() as f64;
    let loss = fixed
        .iter()
        .zip(moving.iter())
        .map(|(f, m)| (m - f).powi(2))
        .sum::<f64>()
        / n;
    let grad = fixed
        .iter()
        .zip(moving.iter())
        .map(|(f, m)| 2.0 * (m - f) / n)
        .collect();
    (loss, grad)
}
