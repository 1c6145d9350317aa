use std::collections::HashMap;
use std::ops::{Index, IndexMut};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use ndarray::{s, Array3, ArrayD, ArrayView, ArrayView3, Axis, Ix3};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::consts::{is_foreground, BACKGROUND};
use crate::{Idx3d, Vec3};

pub mod lr_pair;

pub use lr_pair::{lr_pair, mul3, LrPair, PairStats};

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 将 (x, y, z) 转换成 (z, y, x). 以后均按照该模式访问.
#[inline]
fn get_shape_from_header(h: &NiftiHeader) -> Idx3d {
    // [x, y, z]. 体素个数数组.
    let [_, x, y, z, ..] = h.dim;
    (z as usize, y as usize, x as usize)
}

/// 将 nifti 的 `[x, y, z]` 存储转置为 `(z, y, x)` 的标准布局数组.
fn permute_to_zyx<T>(header: &NiftiHeader, data: ArrayD<T>) -> Array3<T> {
    // [x, y, z] -> [z, y, x].
    // hint: nifti 数据按列优先存储, 转置后恰为行优先.
    let data = data.permuted_axes([2, 1, 0].as_slice());

    // The nature of nifti data field layout.
    debug_assert!(data.is_standard_layout());

    // 该操作不会生成 `Err`, 可直接 unwrap.
    Array3::<T>::from_shape_vec(get_shape_from_header(header), data.into_raw_vec()).unwrap()
}

/// `(z, y, x)` 形状 -> header 中的 `[x, y, z]`. 超出 `u16` 的维度取 `u16::MAX` 并告警,
/// 数组本身的形状不受影响.
fn header_dims((z, y, x): Idx3d) -> [u16; 3] {
    [x, y, z].map(|n| {
        u16::try_from(n).unwrap_or_else(|_| {
            warn!("Dimension {n} does not fit a nifti header, saturated to {}.", u16::MAX);
            u16::MAX
        })
    })
}

/// 根据 `(z, y, x)` 形状和体素尺寸创建一个最小 header.
fn synthetic_header(shape: Idx3d, [vz, vy, vx]: [f32; 3]) -> BoxedHeader {
    let mut header = Box::<NiftiHeader>::default();
    let [x, y, z] = header_dims(shape);
    header.dim = [3, x, y, z, 1, 1, 1, 1];
    let [_, px, py, pz, ..] = &mut header.pixdim;
    (*px, *py, *pz) = (vx, vy, vz);
    header.intent_name[..4].copy_from_slice(b"fake");
    header
}

/// 用新形状更新 header 中的 `dim` 字段 (重采样后形状可能改变).
fn reshaped_header(header: &NiftiHeader, shape: Idx3d) -> BoxedHeader {
    let mut header = Box::new(header.clone());
    header.dim[1..4].copy_from_slice(&header_dims(shape));
    header
}

/// 3D 体数据 nifti header 的共用属性和部分通用操作.
pub trait NiftiHeaderAttr {
    /// 获取 header 部分.
    fn header(&self) -> &NiftiHeader;

    /// 获取数据形状大小 `(z, y, x)`.
    fn shape(&self) -> Idx3d;

    /// 检查索引是否合法.
    #[inline]
    fn check(&self, (z0, h0, w0): &Idx3d) -> bool {
        let (z, h, w) = self.shape();
        *z0 < z && *h0 < h && *w0 < w
    }

    /// 获取单个体素尺寸 `[z, y, x]`. 单位与 nifti header 一致 (一般为毫米).
    #[inline]
    fn voxel_size(&self) -> [f64; 3] {
        let [_, x, y, z, ..] = self.header().pixdim;
        [z as f64, y as f64, x as f64]
    }

    /// 获取体素的实际体积值.
    #[inline]
    fn voxel(&self) -> f64 {
        self.voxel_size().iter().product()
    }

    /// 旋转中心 / 几何中心 `(shape - 1) / 2`.
    #[inline]
    fn center(&self) -> Vec3 {
        let (z, y, x) = self.shape();
        [
            (z as f64 - 1.0) / 2.0,
            (y as f64 - 1.0) / 2.0,
            (x as f64 - 1.0) / 2.0,
        ]
    }
}

/// nii 格式的 3D 强度扫描 (MRI 或 micro-CT), 强度值以 `f32` 保存.
#[derive(Debug, Clone)]
pub struct ScanVolume {
    header: BoxedHeader,
    data: Array3<f32>,
}

impl NiftiHeaderAttr for ScanVolume {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }

    #[inline]
    fn shape(&self) -> Idx3d {
        self.data.dim()
    }
}

impl Index<Idx3d> for ScanVolume {
    type Output = f32;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx3d> for ScanVolume {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl ScanVolume {
    /// 打开 nii 文件格式的 3D 扫描. `path` 为 nii 文件的本地路径.
    /// 如果打开成功, 则返回 `Ok(Self)`, 否则返回 `Err`.
    pub fn open<P: AsRef<Path>>(path: P) -> nifti::Result<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let header = Box::new(obj.header().clone());

        let data = permute_to_zyx(&header, obj.into_volume().into_ndarray::<f32>()?);

        Ok(Self { header, data })
    }

    /// 根据裸数据 (按 `(z, y, x)` 组织) 和体素尺寸 `[z, y, x]` 直接创建实体.
    ///
    /// # 注意
    ///
    /// 该方法创建的 header 仅包含形状与体素尺寸, 你应仅将其用于实验或测试目的.
    pub fn from_array(data: Array3<f32>, voxel_size: [f32; 3]) -> Self {
        let header = synthetic_header(data.dim(), voxel_size);
        Self { header, data }
    }

    /// 以 `self` 的元信息包装新数据. 用于重采样后生成新的体数据.
    pub fn with_data(&self, data: Array3<f32>) -> Self {
        let header = reshaped_header(&self.header, data.dim());
        Self { header, data }
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, f32, Ix3> {
        self.data.view()
    }
}

/// nii 格式的 3D 解剖分割, 标签值以 `u32` 保存 (Allen 图谱的标签可能很大).
#[derive(Debug, Clone)]
pub struct SegVolume {
    header: BoxedHeader,
    data: Array3<u32>,
}

impl NiftiHeaderAttr for SegVolume {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }

    #[inline]
    fn shape(&self) -> Idx3d {
        self.data.dim()
    }
}

impl Index<Idx3d> for SegVolume {
    type Output = u32;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx3d> for SegVolume {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

/// 一个标签在体数据中的轴对齐包围盒, 上下界均为闭区间.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VolumeBounds {
    /// 最小角.
    pub min: Idx3d,

    /// 最大角 (包含).
    pub max: Idx3d,
}

impl VolumeBounds {
    /// 只包含一个体素的包围盒.
    #[inline]
    pub fn from_point(p: Idx3d) -> Self {
        Self { min: p, max: p }
    }

    /// 扩展包围盒使其包含 `p`.
    #[inline]
    pub fn extend(&mut self, (z, y, x): Idx3d) {
        self.min = (self.min.0.min(z), self.min.1.min(y), self.min.2.min(x));
        self.max = (self.max.0.max(z), self.max.1.max(y), self.max.2.max(x));
    }

    /// 合并两个包围盒.
    #[inline]
    pub fn union(mut self, other: &Self) -> Self {
        self.extend(other.min);
        self.extend(other.max);
        self
    }

    /// 包围盒的形状.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        (
            self.max.0 - self.min.0 + 1,
            self.max.1 - self.min.1 + 1,
            self.max.2 - self.min.2 + 1,
        )
    }
}

impl SegVolume {
    /// 打开 nii 文件格式的 3D 分割. `path` 为 nii 文件的本地路径. 如果打开成功,
    /// 则返回 `Ok(Self)`, 否则返回 `Err`.
    pub fn open<P: AsRef<Path>>(path: P) -> nifti::Result<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let header = Box::new(obj.header().clone());

        let data = permute_to_zyx(&header, obj.into_volume().into_ndarray::<u32>()?);

        Ok(Self { header, data })
    }

    /// 根据裸标签数据 (按 `(z, y, x)` 组织) 和体素尺寸 `[z, y, x]` 直接创建实体.
    ///
    /// # 注意
    ///
    /// 该方法创建的 header 仅包含形状与体素尺寸, 你应仅将其用于实验或测试目的.
    pub fn from_array(data: Array3<u32>, voxel_size: [f32; 3]) -> Self {
        let header = synthetic_header(data.dim(), voxel_size);
        Self { header, data }
    }

    /// 以 `self` 的元信息包装新数据.
    pub fn with_data(&self, data: Array3<u32>) -> Self {
        let header = reshaped_header(&self.header, data.dim());
        Self { header, data }
    }

    /// 判断该结构是否是由 `from_array` 手动拼接的.
    pub fn is_faked(&self) -> bool {
        self.header.intent_name.starts_with(b"fake")
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, u32, Ix3> {
        self.data.view()
    }

    /// 获取所有非背景标签, 升序且无重复.
    pub fn labels(&self) -> Vec<u32> {
        let mut ans: Vec<u32> = self.data.iter().copied().filter(|&p| is_foreground(p)).collect();
        ans.sort_unstable();
        ans.dedup();
        ans
    }

    /// 获取 3D 分割中值为 `label` 的体素个数.
    #[inline]
    pub fn count(&self, label: u32) -> usize {
        self.data.iter().filter(|p| **p == label).count()
    }

    /// 获取所有前景体素个数.
    #[inline]
    pub fn foreground_count(&self) -> usize {
        self.data.iter().filter(|p| is_foreground(**p)).count()
    }

    /// 收集满足谓词 `pred` 的所有体素对应的下标, 结果按行优先存储.
    pub fn filter_pos<F: Fn(u32) -> bool>(&self, pred: F) -> Vec<Idx3d> {
        self.data
            .indexed_iter()
            .filter_map(|(pos, pixel)| pred(*pixel).then_some(pos))
            .collect()
    }

    /// 一次遍历求出每个非背景标签的包围盒.
    pub fn label_bounds(&self) -> HashMap<u32, VolumeBounds> {
        let mut ans = HashMap::<u32, VolumeBounds>::new();
        for (pos, &label) in self.data.indexed_iter().filter(|(_, p)| is_foreground(**p)) {
            ans.entry(label)
                .and_modify(|b| b.extend(pos))
                .or_insert_with(|| VolumeBounds::from_point(pos));
        }
        ans
    }

    /// 获取包围盒 `bounds` 范围内的子视图.
    #[inline]
    pub fn view_within(&self, bounds: &VolumeBounds) -> ArrayView3<'_, u32> {
        let (z0, y0, x0) = bounds.min;
        let (z1, y1, x1) = bounds.max;
        self.data.slice(s![z0..=z1, y0..=y1, x0..=x1])
    }

    /// 获取 `pos` 前后上下左右六个点的坐标.
    ///
    /// 在数据范围外的坐标会被过滤掉, 不会包含在返回值中.
    pub(crate) fn diamond_neighbours(&self, (z, h, w): Idx3d) -> Vec<Idx3d> {
        self.check_collect([
            (z.wrapping_sub(1), h, w),
            (z.saturating_add(1), h, w),
            (z, h.wrapping_sub(1), w),
            (z, h.saturating_add(1), w),
            (z, h, w.wrapping_sub(1)),
            (z, h, w.saturating_add(1)),
        ])
    }

    /// 收集 `data` 中不越界的索引.
    #[inline]
    fn check_collect<B: FromIterator<Idx3d>, const N: usize>(&self, data: [Idx3d; N]) -> B {
        data.into_iter().filter(|p| self.check(p)).collect()
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
    }
}

/// 并发操作部分
#[cfg(feature = "rayon")]
impl SegVolume {
    /// 借助 `rayon`, 按水平切片并行地求出每个非背景标签的包围盒.
    pub fn par_label_bounds(&self) -> HashMap<u32, VolumeBounds> {
        self.data()
            .axis_iter(Axis(0))
            .into_par_iter()
            .enumerate()
            .fold(HashMap::<u32, VolumeBounds>::new, |mut acc, (z, sli)| {
                for ((y, x), &label) in sli.indexed_iter().filter(|(_, p)| is_foreground(**p)) {
                    acc.entry(label)
                        .and_modify(|b| b.extend((z, y, x)))
                        .or_insert_with(|| VolumeBounds::from_point((z, y, x)));
                }
                acc
            })
            .reduce(HashMap::new, |mut a, b| {
                for (label, bounds) in b {
                    a.entry(label)
                        .and_modify(|cur| *cur = cur.union(&bounds))
                        .or_insert(bounds);
                }
                a
            })
    }
}

/// 一只小鼠的三模态体数据: MRI, micro-CT 与解剖分割.
///
/// 该结构完全透明, 仅包含三个公开的子结构.
#[derive(Debug, Clone)]
pub struct SubjectVolumes {
    /// 3D MRI 扫描.
    pub mri: ScanVolume,

    /// 3D micro-CT 扫描.
    pub micro_ct: ScanVolume,

    /// 3D 解剖分割.
    pub segmentation: SegVolume,
}

impl SubjectVolumes {
    /// 组合三模态数据.
    ///
    /// 三者形状或体素尺寸不一致时仅输出警告 (以 MRI 的元信息为准),
    /// 因为不同模态之间的轻微配准漂移是可以容忍的.
    pub fn new(mri: ScanVolume, micro_ct: ScanVolume, segmentation: SegVolume) -> Self {
        let shapes = [mri.shape(), micro_ct.shape(), segmentation.shape()];
        if shapes.iter().any(|s| *s != shapes[0]) {
            warn!("The shapes of the mouse data do not match {shapes:?}, defaulted to MRI shape.");
        }
        let sizes = [
            mri.voxel_size(),
            micro_ct.voxel_size(),
            segmentation.voxel_size(),
        ];
        if sizes.iter().any(|s| *s != sizes[0]) {
            warn!(
                "The voxel sizes of the mouse data do not match {sizes:?}, defaulted to MRI voxel size."
            );
        }
        Self {
            mri,
            micro_ct,
            segmentation,
        }
    }

    /// 数据形状, 以 MRI 为准.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.mri.shape()
    }

    /// 体素尺寸 `[z, y, x]`, 以 MRI 为准.
    #[inline]
    pub fn voxel_size(&self) -> [f64; 3] {
        self.mri.voxel_size()
    }
}

/// 一只小鼠: 编号, 数据目录和三模态体数据.
#[derive(Debug, Clone)]
pub struct Mouse {
    id: String,
    folder: PathBuf,

    /// 三模态体数据.
    pub volumes: SubjectVolumes,
}

impl Mouse {
    /// 由已经加载好的体数据创建.
    pub fn new<S: Into<String>, P: Into<PathBuf>>(
        id: S,
        folder: P,
        volumes: SubjectVolumes,
    ) -> Self {
        Self {
            id: id.into(),
            folder: folder.into(),
            volumes,
        }
    }

    /// 分别打开 nii 文件格式的 MRI, micro-CT 和分割. 如果任一文件打开失败, 则返回 `Err`.
    ///
    /// 三个文件不在同一目录下时仅输出警告, 以 MRI 所在目录为准.
    pub fn open(
        id: &str,
        mri_path: impl AsRef<Path>,
        ct_path: impl AsRef<Path>,
        seg_path: impl AsRef<Path>,
    ) -> nifti::Result<Self> {
        let parent = |p: &Path| p.parent().map(Path::to_path_buf).unwrap_or_default();
        let folders = [
            parent(mri_path.as_ref()),
            parent(ct_path.as_ref()),
            parent(seg_path.as_ref()),
        ];
        if folders.iter().any(|f| *f != folders[0]) {
            warn!("The folder paths of the mouse data do not match, defaulted to MRI folder path.");
        }

        let mri = ScanVolume::open(mri_path.as_ref())?;
        let micro_ct = ScanVolume::open(ct_path.as_ref())?;
        let segmentation = SegVolume::open(seg_path.as_ref())?;
        debug!("Loaded mouse `{id}` with shape {:?}", mri.shape());

        let [folder, ..] = folders;
        Ok(Self::new(
            id,
            folder,
            SubjectVolumes::new(mri, micro_ct, segmentation),
        ))
    }

    /// 小鼠编号.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 数据所在目录.
    #[inline]
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// 数据形状.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.volumes.shape()
    }

    /// 体素尺寸 `[z, y, x]`.
    #[inline]
    pub fn voxel_size(&self) -> [f64; 3] {
        self.volumes.voxel_size()
    }

    /// 分割中的所有非背景标签, 升序.
    #[inline]
    pub fn labels(&self) -> Vec<u32> {
        self.volumes.segmentation.labels()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_volume() -> SegVolume {
        let mut data = Array3::<u32>::zeros((6, 7, 8));
        data.slice_mut(s![1..3, 2..5, 3..4]).fill(4);
        data[(5, 6, 7)] = 9;
        SegVolume::from_array(data, [0.5, 0.25, 0.25])
    }

    #[test]
    fn test_synthetic_header_voxel_size() {
        let seg = cube_volume();
        assert_eq!(seg.voxel_size(), [0.5, 0.25, 0.25]);
        assert_eq!(seg.shape(), (6, 7, 8));
        assert!(seg.is_faked());
        assert!((seg.voxel() - 0.03125).abs() < 1e-12);
        assert_eq!(seg.center(), [2.5, 3.0, 3.5]);
    }

    #[test]
    fn test_header_dims_saturate() {
        let seg = SegVolume::from_array(Array3::<u32>::zeros((2, 1, 70000)), [1.0; 3]);
        assert_eq!(seg.shape(), (2, 1, 70000));
        assert_eq!(seg.header().dim[1..4], [u16::MAX, 1, 2]);
        assert_eq!(header_dims((3, 65535, 65536)), [u16::MAX, 65535, 3]);
    }

    #[test]
    fn test_labels_sorted_without_background() {
        let seg = cube_volume();
        assert_eq!(seg.labels(), vec![4, 9]);
        assert_eq!(seg.count(4), 6);
        assert_eq!(seg.foreground_count(), 7);
        assert_eq!(seg.count(BACKGROUND), 6 * 7 * 8 - 7);
    }

    #[test]
    fn test_label_bounds() {
        let seg = cube_volume();
        let bounds = seg.label_bounds();
        assert_eq!(bounds.len(), 2);
        assert_eq!(bounds[&4].min, (1, 2, 3));
        assert_eq!(bounds[&4].max, (2, 4, 3));
        assert_eq!(bounds[&4].shape(), (2, 3, 1));
        assert_eq!(seg.view_within(&bounds[&4]).iter().filter(|p| **p == 4).count(), 6);
        assert_eq!(bounds[&9], VolumeBounds::from_point((5, 6, 7)));
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn test_par_label_bounds_matches_sequential() {
        let seg = cube_volume();
        assert_eq!(seg.par_label_bounds(), seg.label_bounds());
    }

    #[test]
    fn test_with_data_updates_shape() {
        let scan = ScanVolume::from_array(Array3::zeros((2, 3, 4)), [1.0, 1.0, 1.0]);
        let other = scan.with_data(Array3::zeros((4, 3, 2)));
        assert_eq!(other.shape(), (4, 3, 2));
        assert_eq!(other.header().dim[1], 2);
        assert_eq!(other.header().dim[3], 4);
    }
}
