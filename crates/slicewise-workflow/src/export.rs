//! 切片导出
//!
//! 单个序列内的切片以有界并发渲染，结果按实例号重组，失败的切片被剔除

use crate::providers::{RenderOptions, RenderedImage, SliceRenderer};
use futures::stream::{self, StreamExt};
use slicewise_core::{Slice, SlicewiseError, WindowLevel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 单个序列的导出结果，`slices` 与 `images` 一一对应
#[derive(Debug, Clone, Default)]
pub struct SeriesExport {
    pub slices: Vec<Slice>,
    pub images: Vec<RenderedImage>,
    /// 渲染失败的实例号及原因
    pub failed: Vec<(i32, String)>,
}

impl SeriesExport {
    pub fn total_bytes(&self) -> usize {
        self.images.iter().map(RenderedImage::byte_len).sum()
    }
}

/// 导出一个序列的切片；取消时返回 None
pub async fn export_series(
    renderer: &dyn SliceRenderer,
    slices: &[Slice],
    window: WindowLevel,
    options: &RenderOptions,
    concurrency: usize,
    token: &CancellationToken,
) -> Option<SeriesExport> {
    // 流中持有切片副本，返回的 future 才能在其他任务中执行
    let rendering = stream::iter(slices.iter().cloned())
        .map(|slice| async move {
            let result = renderer.render_slice(&slice, window, options).await;
            (slice, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<(Slice, Result<RenderedImage, SlicewiseError>)>>();

    let mut results = tokio::select! {
        _ = token.cancelled() => {
            debug!("导出已取消");
            return None;
        }
        results = rendering => results,
    };
    if token.is_cancelled() {
        return None;
    }

    results.sort_by_key(|(slice, _)| slice.instance_number);

    let mut export = SeriesExport::default();
    for (slice, result) in results {
        match result {
            Ok(image) => {
                export.slices.push(slice);
                export.images.push(image);
            }
            Err(e) => {
                warn!("切片 {} 渲染失败，已剔除: {}", slice.instance_number, e);
                export.failed.push((slice.instance_number, e.to_string()));
            }
        }
    }

    if !export.failed.is_empty() {
        warn!(
            "导出 {} 张中失败 {} 张",
            slices.len(),
            export.failed.len()
        );
    }
    Some(export)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use slicewise_core::{ImageHandle, Result};
    use std::sync::Arc;
    use std::time::Duration;

    struct DelayRenderer;

    #[async_trait]
    impl SliceRenderer for DelayRenderer {
        async fn render_slice(
            &self,
            slice: &Slice,
            _window: WindowLevel,
            _options: &RenderOptions,
        ) -> Result<RenderedImage> {
            // 实例号越小完成越晚，打乱完成顺序
            tokio::time::sleep(Duration::from_millis((20 - slice.instance_number) as u64)).await;
            if slice.instance_number == 7 {
                return Err(SlicewiseError::ExportFailure("解码失败".to_string()));
            }
            Ok(RenderedImage {
                instance_number: slice.instance_number,
                mime_type: "image/jpeg".to_string(),
                width: 256,
                height: 256,
                data: vec![0; 10],
            })
        }
    }

    fn slices(instances: &[i32]) -> Vec<Slice> {
        instances
            .iter()
            .map(|&n| Slice {
                instance_number: n,
                position: [0.0, 0.0, n as f64],
                orientation: None,
                slice_location: None,
                image: ImageHandle::new(format!("img/{}", n)),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_reassembles_in_instance_order() {
        let input = slices(&[1, 3, 5, 7, 9, 11]);
        let export = export_series(
            &DelayRenderer,
            &input,
            WindowLevel::new(40.0, 400.0),
            &RenderOptions::default(),
            4,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let order: Vec<i32> = export.images.iter().map(|i| i.instance_number).collect();
        assert_eq!(order, vec![1, 3, 5, 9, 11]);
        assert_eq!(export.slices.len(), export.images.len());
        assert_eq!(export.failed.len(), 1);
        assert_eq!(export.failed[0].0, 7);
        assert_eq!(export.total_bytes(), 50);
    }

    #[tokio::test]
    async fn test_export_runs_in_spawned_task() {
        let renderer: Arc<dyn SliceRenderer> = Arc::new(DelayRenderer);
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let token = token.clone();
            async move {
                let options = RenderOptions::default();
                export_series(
                    renderer.as_ref(),
                    &slices(&[2, 4, 6]),
                    WindowLevel::new(40.0, 400.0),
                    &options,
                    2,
                    &token,
                )
                .await
            }
        });

        let export = handle.await.unwrap().unwrap();
        let order: Vec<i32> = export.slices.iter().map(|s| s.instance_number).collect();
        assert_eq!(order, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let export = export_series(
            &DelayRenderer,
            &slices(&[1, 2]),
            WindowLevel::new(40.0, 400.0),
            &RenderOptions::default(),
            2,
            &token,
        )
        .await;
        assert!(export.is_none());
    }
}
