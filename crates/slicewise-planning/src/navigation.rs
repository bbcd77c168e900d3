//! 视图导航
//!
//! 把解析出的切片映射定位到查看器中的具体图像

use slicewise_core::{ImageHandle, Result, SliceMapping, SlicewiseError, Study};
use tracing::{debug, info};

/// 图像查看器接口，由界面层实现
pub trait Viewport {
    /// 载入一个序列的全部图像，顺序即显示顺序
    fn load_series(&mut self, images: &[ImageHandle]) -> Result<()>;

    fn set_index(&mut self, index: usize) -> Result<()>;

    fn render(&mut self) -> Result<()>;

    fn current_index(&self) -> usize;

    fn loaded_handles(&self) -> Vec<ImageHandle>;
}

/// 跳转到映射对应的切片，必要时先切换序列；返回切片在序列中的下标
pub fn navigate_to<V: Viewport + ?Sized>(
    viewport: &mut V,
    study: &Study,
    mapping: &SliceMapping,
) -> Result<usize> {
    let series = study
        .series_by_uid(&mapping.series_uid)
        .or_else(|| study.find_series(&mapping.series_number.to_string()))
        .ok_or_else(|| {
            SlicewiseError::NotFound(format!("序列 {} ({})", mapping.series_number, mapping.series_uid))
        })?;

    let index = series
        .index_of_instance(mapping.instance_number)
        .or_else(|| series.slices.iter().position(|s| s.image == mapping.image))
        .ok_or_else(|| {
            SlicewiseError::NotFound(format!(
                "序列 {} 中的实例 {}",
                series.series_number, mapping.instance_number
            ))
        })?;

    let handles: Vec<ImageHandle> = series.slices.iter().map(|s| s.image.clone()).collect();
    if viewport.loaded_handles() != handles {
        debug!("切换查看器序列到 {}", series.display_name());
        viewport.load_series(&handles)?;
    }

    viewport.set_index(index)?;
    viewport.render()?;
    info!("已跳转到 {}", mapping.label);
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SliceAddressResolver;
    use crate::testing::{study_with, SeriesSpec};

    #[derive(Default)]
    struct RecordingViewport {
        handles: Vec<ImageHandle>,
        index: usize,
        loads: usize,
        renders: usize,
    }

    impl Viewport for RecordingViewport {
        fn load_series(&mut self, images: &[ImageHandle]) -> Result<()> {
            self.handles = images.to_vec();
            self.index = 0;
            self.loads += 1;
            Ok(())
        }

        fn set_index(&mut self, index: usize) -> Result<()> {
            if index >= self.handles.len() {
                return Err(SlicewiseError::Internal(format!("下标越界: {}", index)));
            }
            self.index = index;
            Ok(())
        }

        fn render(&mut self) -> Result<()> {
            self.renders += 1;
            Ok(())
        }

        fn current_index(&self) -> usize {
            self.index
        }

        fn loaded_handles(&self) -> Vec<ImageHandle> {
            self.handles.clone()
        }
    }

    fn mapping_for(study: &Study, series_number: i32, instance: i32) -> SliceMapping {
        let series = study.find_series(&series_number.to_string()).unwrap();
        let slice = &series.slices[series.index_of_instance(instance).unwrap()];
        SliceAddressResolver::new()
            .build_mappings(series, std::slice::from_ref(slice), 1)
            .remove(0)
    }

    #[test]
    fn test_navigate_loads_series_and_sets_index() {
        let study = study_with(&[SeriesSpec::axial(1, 40), SeriesSpec::sagittal(2, 20)]);
        let mut viewport = RecordingViewport::default();

        let index = navigate_to(&mut viewport, &study, &mapping_for(&study, 2, 7)).unwrap();
        assert_eq!(index, 6);
        assert_eq!(viewport.current_index(), 6);
        assert_eq!(viewport.loaded_handles().len(), 20);
        assert_eq!(viewport.renders, 1);

        // 同一序列内跳转不重新载入
        navigate_to(&mut viewport, &study, &mapping_for(&study, 2, 15)).unwrap();
        assert_eq!(viewport.loads, 1);
        assert_eq!(viewport.current_index(), 14);

        navigate_to(&mut viewport, &study, &mapping_for(&study, 1, 40)).unwrap();
        assert_eq!(viewport.loads, 2);
        assert_eq!(viewport.current_index(), 39);
    }

    #[test]
    fn test_navigate_unknown_series() {
        let study = study_with(&[SeriesSpec::axial(1, 10)]);
        let mut mapping = mapping_for(&study, 1, 3);
        mapping.series_uid = "missing".to_string();
        mapping.series_number = 99;

        let result = navigate_to(&mut RecordingViewport::default(), &study, &mapping);
        assert!(matches!(result, Err(SlicewiseError::NotFound(_))));
    }
}
