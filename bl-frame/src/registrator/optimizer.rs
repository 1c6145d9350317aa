//! 优化器. 所有优化器都作用于同一个目标函数 `params -> (loss, gradient)`.
//!
//! `scales[i]` 表示参数 `i` 变化 1 时引起的典型位移 (体素), 用于平衡角度与平移的量纲.

use std::collections::VecDeque;

use log::{debug, trace};

use super::config::{Exhaustive, GradientDescent, Lbfgs, Optimizer};
use super::{RegResult, RegistrationError, StopReason};

/// 优化结果.
#[derive(Clone, Debug)]
pub(crate) struct Outcome {
    pub params: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
    pub stop: StopReason,
}

/// 目标函数求值一次, 并检查结果有限.
fn eval<F>(f: &F, p: &[f64]) -> RegResult<(f64, Vec<f64>)>
where
    F: Fn(&[f64]) -> RegResult<(f64, Vec<f64>)>,
{
    let (v, g) = f(p)?;
    if !v.is_finite() || g.iter().any(|x| !x.is_finite()) {
        return Err(RegistrationError::NonFiniteMetric);
    }
    Ok((v, g))
}

/// 按配置运行优化器.
pub(crate) fn optimize<F>(
    optimizer: &Optimizer,
    init: Vec<f64>,
    scales: &[f64],
    f: F,
) -> RegResult<Outcome>
where
    F: Fn(&[f64]) -> RegResult<(f64, Vec<f64>)>,
{
    debug_assert_eq!(init.len(), scales.len());
    match optimizer {
        Optimizer::GradientDescent(gd) => gradient_descent(gd, init, scales, &f),
        Optimizer::Lbfgs(lb) => lbfgs(lb, init, scales, &f),
        Optimizer::Exhaustive(ex) => exhaustive(ex, init, scales, &f),
    }
}

fn gradient_descent<F>(
    gd: &GradientDescent,
    mut p: Vec<f64>,
    scales: &[f64],
    f: &F,
) -> RegResult<Outcome>
where
    F: Fn(&[f64]) -> RegResult<(f64, Vec<f64>)>,
{
    let mut lr = gd.learning_rate;
    let mut window = VecDeque::with_capacity(gd.convergence_window + 1);
    let mut value = f64::NAN;

    for it in 0..gd.iterations {
        let (v, g) = eval(f, &p)?;
        value = v;
        trace!("GD iteration {it}: metric = {v:.6e}");

        window.push_back(v);
        if window.len() > gd.convergence_window {
            window.pop_front();
        }
        if window.len() == gd.convergence_window && gd.convergence_window >= 2 {
            let (first, last) = (window[0], window[window.len() - 1]);
            let rel = (first - last).abs() / last.abs().max(f64::MIN_POSITIVE);
            if rel < gd.convergence_minimum {
                return Ok(Outcome {
                    params: p,
                    value,
                    iterations: it + 1,
                    stop: StopReason::Converged,
                });
            }
        }

        // 以 scale 为预条件的梯度.
        let h: Vec<f64> = g.iter().zip(scales).map(|(g, s)| g / (s * s)).collect();
        let shift = h
            .iter()
            .zip(scales)
            .fold(0f64, |m, (h, s)| m.max(h.abs() * s));
        if shift == 0.0 {
            return Ok(Outcome {
                params: p,
                value,
                iterations: it + 1,
                stop: StopReason::Converged,
            });
        }
        if gd.estimate_learning_rate && it == 0 {
            lr = gd.max_step / shift;
            debug!("Estimated learning rate {lr:.6e}");
        }
        // 单步位移不超过 `max_step`.
        let step = if gd.estimate_learning_rate {
            lr.min(gd.max_step / shift)
        } else {
            lr
        };
        p.iter_mut().zip(h.iter()).for_each(|(p, h)| *p -= step * h);
    }

    Ok(Outcome {
        params: p,
        value,
        iterations: gd.iterations,
        stop: StopReason::MaxIterations,
    })
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn inf_norm(a: &[f64]) -> f64 {
    a.iter().fold(0f64, |m, v| m.max(v.abs()))
}

/// L-BFGS, 在缩放后的参数空间 `q = p * s` 中运行.
fn lbfgs<F>(lb: &Lbfgs, init: Vec<f64>, scales: &[f64], f: &F) -> RegResult<Outcome>
where
    F: Fn(&[f64]) -> RegResult<(f64, Vec<f64>)>,
{
    const ARMIJO: f64 = 1e-4;
    const MAX_BACKTRACK: usize = 30;

    let to_p = |q: &[f64]| -> Vec<f64> { q.iter().zip(scales).map(|(q, s)| q / s).collect() };
    let scaled = |q: &[f64]| -> RegResult<(f64, Vec<f64>)> {
        let (v, g) = eval(f, &to_p(q))?;
        Ok((v, g.iter().zip(scales).map(|(g, s)| g / s).collect()))
    };

    let mut q: Vec<f64> = init.iter().zip(scales).map(|(p, s)| p * s).collect();
    let (mut v, mut g) = scaled(&q)?;
    let mut history: VecDeque<(Vec<f64>, Vec<f64>, f64)> = VecDeque::new();

    for it in 0..lb.iterations {
        if inf_norm(&g) < lb.gradient_tolerance {
            return Ok(Outcome {
                params: to_p(&q),
                value: v,
                iterations: it,
                stop: StopReason::GradientTolerance,
            });
        }

        // two-loop recursion
        let mut d: Vec<f64> = g.clone();
        let mut alphas = Vec::with_capacity(history.len());
        for (s, y, rho) in history.iter().rev() {
            let a = rho * dot(s, &d);
            d.iter_mut().zip(y).for_each(|(d, y)| *d -= a * y);
            alphas.push(a);
        }
        let gamma = history
            .back()
            .map_or(1.0 / inf_norm(&g).max(1.0), |(s, y, _)| dot(s, y) / dot(y, y));
        d.iter_mut().for_each(|d| *d *= gamma);
        for ((s, y, rho), a) in history.iter().zip(alphas.iter().rev()) {
            let b = rho * dot(y, &d);
            d.iter_mut().zip(s).for_each(|(d, s)| *d += (a - b) * s);
        }
        d.iter_mut().for_each(|d| *d = -*d);

        let slope = dot(&g, &d);
        if slope >= 0.0 {
            // 不是下降方向, 重置历史.
            history.clear();
            d = g.iter().map(|g| -g).collect();
        }
        let slope = dot(&g, &d);

        let mut alpha = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_BACKTRACK {
            let cand: Vec<f64> = q.iter().zip(&d).map(|(q, d)| q + alpha * d).collect();
            let (cv, cg) = scaled(&cand)?;
            if cv <= v + ARMIJO * alpha * slope {
                accepted = Some((cand, cv, cg));
                break;
            }
            alpha *= 0.5;
        }
        let Some((nq, nv, ng)) = accepted else {
            return Ok(Outcome {
                params: to_p(&q),
                value: v,
                iterations: it + 1,
                stop: StopReason::Converged,
            });
        };
        trace!("LBFGS iteration {it}: metric = {nv:.6e}, step = {alpha:.3e}");

        let s: Vec<f64> = nq.iter().zip(&q).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = ng.iter().zip(&g).map(|(a, b)| a - b).collect();
        let sy = dot(&s, &y);
        if sy > 1e-12 {
            history.push_back((s, y, 1.0 / sy));
            if history.len() > lb.max_corrections {
                history.pop_front();
            }
        }
        (q, v, g) = (nq, nv, ng);
    }

    Ok(Outcome {
        params: to_p(&q),
        value: v,
        iterations: lb.iterations,
        stop: StopReason::MaxIterations,
    })
}

/// 以 `init` 为中心的网格穷举.
fn exhaustive<F>(ex: &Exhaustive, init: Vec<f64>, scales: &[f64], f: &F) -> RegResult<Outcome>
where
    F: Fn(&[f64]) -> RegResult<(f64, Vec<f64>)>,
{
    let n = init.len();
    let last = ex.steps.last().copied().unwrap_or(0);
    let steps: Vec<i64> = (0..n)
        .map(|i| ex.steps.get(i).copied().unwrap_or(last) as i64)
        .collect();

    let mut k: Vec<i64> = steps.iter().map(|s| -s).collect();
    let mut best = (f64::INFINITY, init.clone());
    let mut count = 0usize;
    loop {
        let p: Vec<f64> = init
            .iter()
            .zip(&k)
            .zip(scales)
            .map(|((p, k), s)| p + *k as f64 * ex.step_length / s)
            .collect();
        let (v, _) = eval(f, &p)?;
        count += 1;
        if v < best.0 {
            best = (v, p);
        }

        // 里程表式递增
        let mut axis = 0;
        loop {
            if axis == n {
                debug!("Exhaustive search evaluated {count} candidates");
                return Ok(Outcome {
                    params: best.1,
                    value: best.0,
                    iterations: count,
                    stop: StopReason::ExhaustiveDone,
                });
            }
            if k[axis] < steps[axis] {
                k[axis] += 1;
                break;
            }
            k[axis] = -steps[axis];
            axis += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `(p0 - 3)^2 + 4 (p1 + 1)^2`
    fn quadratic(p: &[f64]) -> RegResult<(f64, Vec<f64>)> {
        Ok((
            (p[0] - 3.0).powi(2) + 4.0 * (p[1] + 1.0).powi(2),
            vec![2.0 * (p[0] - 3.0), 8.0 * (p[1] + 1.0)],
        ))
    }

    #[test]
    fn test_gradient_descent_fixed_rate() {
        let gd = GradientDescent {
            learning_rate: 0.1,
            iterations: 500,
            convergence_minimum: 0.0,
            convergence_window: 10,
            estimate_learning_rate: false,
            max_step: 1.0,
        };
        let out = optimize(
            &Optimizer::GradientDescent(gd),
            vec![0.0, 0.0],
            &[1.0, 1.0],
            quadratic,
        )
        .unwrap();
        assert!((out.params[0] - 3.0).abs() < 1e-3);
        assert!((out.params[1] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_lbfgs() {
        let out = optimize(
            &Optimizer::Lbfgs(Lbfgs::DEFAULT),
            vec![10.0, 10.0],
            &[1.0, 2.0],
            quadratic,
        )
        .unwrap();
        assert!((out.params[0] - 3.0).abs() < 1e-3);
        assert!((out.params[1] + 1.0).abs() < 1e-3);
        assert!(out.value < 1e-6);
    }

    #[test]
    fn test_exhaustive() {
        let ex = Exhaustive {
            steps: vec![4, 2],
            step_length: 1.0,
        };
        let out = optimize(&Optimizer::Exhaustive(ex), vec![0.0, 0.0], &[1.0, 1.0], quadratic).unwrap();
        assert_eq!(out.iterations, 9 * 5);
        assert_eq!(out.params, vec![3.0, -1.0]);
        assert_eq!(out.stop, StopReason::ExhaustiveDone);
    }

    #[test]
    fn test_non_finite_is_error() {
        let out = optimize(&Optimizer::DEFAULT, vec![0.0], &[1.0], |_| Ok((f64::NAN, vec![0.0])));
        assert!(matches!(out, Err(RegistrationError::NonFiniteMetric)));
    }
}
