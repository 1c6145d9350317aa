//! 通用常量.

use crate::Vec3;

/// 分割体数据中, 背景体素的标签值.
pub const BACKGROUND: u32 = 0;

/// 标准前后轴 (anterior-posterior). Bregma -> Lambda 向量会被旋转到该方向.
pub const CANONICAL_AXIS: Vec3 = [0.0, 1.0, 0.0];

/// 默认的微调允许偏移, 以体素为单位.
pub const DEFAULT_DEVIATION: u32 = 5;

/// 内核质心使用的默认保留比例.
pub const DEFAULT_INNER_FRACTION: f64 = 0.25;

/// `SeparationPolicy::Auto` 判定一个连通分量 "整体位于一侧" 所需的最小比例.
pub const COMPONENT_SIDE_RATIO: f64 = 0.95;

/// 结果表默认文件名 (不含扩展名).
pub const DEFAULT_FILE_NAME: &str = "stereotaxic_coordinates";

/// 骨缝模板默认文件名.
pub mod templates {
    /// 骨缝 (suture) 模板.
    pub const SUTURE: &str = "suture_template_t14.png";

    /// Bregma 标记模板.
    pub const BREGMA: &str = "bregma_template_t14.png";

    /// Lambda 标记模板.
    pub const LAMBDA: &str = "lambda_template_t14.png";
}

/// 体素是否是背景?
#[inline]
pub const fn is_background(label: u32) -> bool {
    label == BACKGROUND
}

/// 体素是否是前景 (任意脑区)?
#[inline]
pub const fn is_foreground(label: u32) -> bool {
    !is_background(label)
}

/// 半球.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Side {
    /// 左半球. 约定为 `x` 较小的一侧.
    Left,

    /// 右半球. 约定为 `x` 较大的一侧.
    Right,
}

impl Side {
    /// 是否为左半球.
    #[inline]
    pub fn is_left(&self) -> bool {
        matches!(self, Self::Left)
    }

    /// 是否为右半球.
    #[inline]
    pub fn is_right(&self) -> bool {
        !self.is_left()
    }
}
