//! 小鼠数据集加载.
//!
//! 提供迭代器风格的数据集获取模式. 每只小鼠的三个 nifti 文件名由编号构造.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Mouse;

/// 文件名构造器. 接受小鼠编号, 获得文件名.
pub type FilenameBuilder = fn(&str) -> String;

/// 加载错误.
#[derive(Error, Debug)]
pub enum LoadError {
    /// 数据目录不存在.
    #[error("`{0}` is not a directory")]
    NotADirectory(PathBuf),

    /// nifti 文件打开失败.
    #[error("Failed to load subject `{id}`: {source}")]
    Nifti {
        /// 小鼠编号.
        id: String,
        /// 底层错误.
        #[source]
        source: nifti::NiftiError,
    },
}

/// 加载结果类型.
pub type LoadResult<T> = Result<T, LoadError>;

/// 默认 MRI 文件名 `{id 小写}_mri.nii.gz`.
pub fn mri_file(id: &str) -> String {
    format!("{}_mri.nii.gz", id.to_lowercase())
}

/// 默认 micro-CT 文件名 `{id 小写}_uCT.nii.gz`.
pub fn ct_file(id: &str) -> String {
    format!("{}_uCT.nii.gz", id.to_lowercase())
}

/// 默认分割文件名 `{id 小写}_seg.nii.gz`.
pub fn seg_file(id: &str) -> String {
    format!("{}_seg.nii.gz", id.to_lowercase())
}

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    ans.extend(it);
    Some(ans)
}

/// 小鼠数据加载器, 并在内部自动转换文件名.
///
/// 默认布局为 `{root}/{id}/{id 小写}_mri.nii.gz` 等;
/// [`SubjectLoader::flat`] 之后所有文件直接位于 `root` 下.
#[derive(Debug, Clone)]
pub struct SubjectLoader {
    root: PathBuf,
    ids_rev: Vec<String>,
    per_subject_folder: bool,
    mri: FilenameBuilder,
    ct: FilenameBuilder,
    seg: FilenameBuilder,
}

impl SubjectLoader {
    /// 从指定编号与根目录创建加载器. `root` 不是目录时返回 `Err`.
    pub fn new<S: Into<String>, I: IntoIterator<Item = S>, P: AsRef<Path>>(
        ids: I,
        root: P,
    ) -> LoadResult<Self> {
        let root = root.as_ref().to_owned();
        if !root.is_dir() {
            return Err(LoadError::NotADirectory(root));
        }
        let mut ids_rev: Vec<String> = ids.into_iter().map(Into::into).collect();
        ids_rev.reverse();
        Ok(Self {
            root,
            ids_rev,
            per_subject_folder: true,
            mri: mri_file,
            ct: ct_file,
            seg: seg_file,
        })
    }

    /// 所有文件直接位于根目录下.
    pub fn flat(mut self) -> Self {
        self.per_subject_folder = false;
        self
    }

    /// 替换文件名构造器.
    pub fn with_builders(
        mut self,
        mri: FilenameBuilder,
        ct: FilenameBuilder,
        seg: FilenameBuilder,
    ) -> Self {
        self.mri = mri;
        self.ct = ct;
        self.seg = seg;
        self
    }

    /// 小鼠数据所在目录.
    pub fn folder_of(&self, id: &str) -> PathBuf {
        if self.per_subject_folder {
            self.root.join(id)
        } else {
            self.root.clone()
        }
    }

    /// 加载单只小鼠.
    pub fn load(&self, id: &str) -> LoadResult<Mouse> {
        let folder = self.folder_of(id);
        Mouse::open(
            id,
            folder.join((self.mri)(id)),
            folder.join((self.ct)(id)),
            folder.join((self.seg)(id)),
        )
        .map_err(|source| LoadError::Nifti {
            id: id.to_string(),
            source,
        })
    }
}

impl Iterator for SubjectLoader {
    type Item = (String, LoadResult<Mouse>);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.ids_rev.pop()?;
        let data = self.load(&id);
        Some((id, data))
    }
}

impl ExactSizeIterator for SubjectLoader {
    #[inline]
    fn len(&self) -> usize {
        self.ids_rev.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        assert_eq!(mri_file("P324"), "p324_mri.nii.gz");
        assert_eq!(ct_file("P324"), "p324_uCT.nii.gz");
        assert_eq!(seg_file("P324"), "p324_seg.nii.gz");
    }

    #[test]
    fn test_loader_layout() {
        let root = std::env::temp_dir();
        let loader = SubjectLoader::new(["P1", "P2"], &root).unwrap();
        assert_eq!(loader.len(), 2);
        assert_eq!(loader.folder_of("P1"), root.join("P1"));
        let loader = loader.flat();
        assert_eq!(loader.folder_of("P1"), root);
    }

    #[test]
    fn test_missing_files_are_errors() {
        let root = std::env::temp_dir();
        let mut loader = SubjectLoader::new(["__no_such_subject__"], &root)
            .unwrap()
            .flat();
        let (id, res) = loader.next().unwrap();
        assert_eq!(id, "__no_such_subject__");
        assert!(matches!(res, Err(LoadError::Nifti { .. })));
        assert!(loader.next().is_none());
    }

    #[test]
    fn test_root_must_be_dir() {
        let err = SubjectLoader::new(Vec::<String>::new(), "/__no_such_dir__").unwrap_err();
        assert!(matches!(err, LoadError::NotADirectory(_)));
    }
}
