//! 检查模型构建器
//!
//! 将逐文件记录分组为 Study → Series → Slice 层级，完成空间排序、几何统计和主序列选择

use crate::orientation::classify_plane;
use crate::record::RawInstanceRecord;
use slicewise_core::utils::{non_empty, parse_dicom_date};
use slicewise_core::{AnatomicalPlane, Series, Slice, SpatialAxis, Study};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// 判定坐标是否变化的阈值（毫米）
const COORDINATE_EPSILON: f64 = 1e-6;

/// 检查模型构建器
#[derive(Debug, Default)]
pub struct StudyModelBuilder;

impl StudyModelBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self
    }

    /// 由逐文件记录构建检查模型
    ///
    /// 没有任何记录时返回空检查，`primary_series_uid` 为空字符串，调用方需自行判断。
    pub fn build(&self, records: &[RawInstanceRecord]) -> Study {
        if records.is_empty() {
            warn!("没有可用的DICOM记录，返回空检查");
            return Study::default();
        }

        // 按序列UID分组，保持首次出现的顺序
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut groups: Vec<(&str, Vec<&RawInstanceRecord>)> = Vec::new();
        for record in records {
            let key = record.series_key();
            match index.get(key) {
                Some(&i) => groups[i].1.push(record),
                None => {
                    index.insert(key, groups.len());
                    groups.push((key, vec![record]));
                }
            }
        }

        let mut series: Vec<Series> = groups
            .into_iter()
            .map(|(uid, group)| self.build_series(uid, &group))
            .collect();
        series.sort_by(|a, b| {
            a.series_number
                .cmp(&b.series_number)
                .then_with(|| a.series_uid.cmp(&b.series_uid))
        });

        let primary_series_uid = Self::select_primary(&series);
        let first = &records[0];
        let study = Study {
            description: non_empty(first.study_description.clone()).unwrap_or_default(),
            modality: non_empty(first.modality.clone()).unwrap_or_default(),
            patient_age: non_empty(first.patient_age.clone()),
            patient_sex: non_empty(first.patient_sex.clone()),
            study_date: first.study_date.as_deref().and_then(parse_dicom_date),
            institution: non_empty(first.institution_name.clone()),
            scanner: first.scanner(),
            primary_series_uid,
            series,
        };

        info!(
            "检查模型构建完成: {} 个序列, {} 张切片, 主序列: {:?}",
            study.series.len(),
            study.total_slices(),
            study.primary_series().map(|s| s.series_number)
        );
        study
    }

    /// 构建单个序列，第一条记录作为序列级字段的代表
    fn build_series(&self, uid: &str, group: &[&RawInstanceRecord]) -> Series {
        let representative = group[0];

        let mut slices: Vec<Slice> = group
            .iter()
            .enumerate()
            .map(|(i, record)| Slice {
                instance_number: record.instance_number.unwrap_or(i as i32 + 1),
                position: record
                    .image_position
                    .unwrap_or_else(|| [0.0, 0.0, record.slice_location.unwrap_or(0.0)]),
                orientation: record.image_orientation,
                slice_location: record.slice_location,
                image: record.image.clone(),
            })
            .collect();

        let plane = classify_plane(representative.image_orientation.as_ref().map(|o| o.as_slice()));
        let sort_axis = Self::varying_axis(&slices);
        match sort_axis {
            Some(axis) => slices.sort_by(|a, b| {
                a.coordinate(axis)
                    .total_cmp(&b.coordinate(axis))
                    .then_with(|| a.instance_number.cmp(&b.instance_number))
            }),
            None => slices.sort_by_key(|s| s.instance_number),
        }

        let span_axis = sort_axis.unwrap_or_else(|| plane.axis());
        let (coordinate_min, coordinate_max) = slices
            .iter()
            .map(|s| s.coordinate(span_axis))
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), c| (lo.min(c), hi.max(c)));
        let instance_min = slices.iter().map(|s| s.instance_number).min().unwrap_or(0);
        let instance_max = slices.iter().map(|s| s.instance_number).max().unwrap_or(0);

        let series = Series {
            series_uid: uid.to_string(),
            series_number: representative.series_number.unwrap_or(0),
            description: non_empty(representative.series_description.clone()).unwrap_or_default(),
            modality: non_empty(representative.modality.clone()).unwrap_or_default(),
            default_window: representative.window(),
            acquisition: representative.acquisition.clone(),
            plane,
            sort_axis,
            coordinate_min,
            coordinate_max,
            instance_min,
            instance_max,
            slices,
        };

        debug!(
            "序列 {} ({}): {} 张, 平面 {}, 排序轴 {:?}, 实例号 [{}, {}]",
            series.series_number,
            series.description,
            series.slice_count(),
            series.plane,
            series.sort_axis,
            series.instance_min,
            series.instance_max
        );
        series
    }

    /// 找出位置变化最大的坐标轴；所有切片共面时返回 None
    fn varying_axis(slices: &[Slice]) -> Option<SpatialAxis> {
        [SpatialAxis::X, SpatialAxis::Y, SpatialAxis::Z]
            .into_iter()
            .map(|axis| {
                let (lo, hi) = slices
                    .iter()
                    .map(|s| s.coordinate(axis))
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), c| (lo.min(c), hi.max(c)));
                (axis, hi - lo)
            })
            .filter(|(_, spread)| *spread > COORDINATE_EPSILON)
            .fold(None, |best: Option<(SpatialAxis, f64)>, (axis, spread)| match best {
                Some((_, best_spread)) if best_spread >= spread => best,
                _ => Some((axis, spread)),
            })
            .map(|(axis, _)| axis)
    }

    /// 主序列：切片最多的轴位序列，其次切片最多的任意序列；并列取序列号最小者
    fn select_primary(series: &[Series]) -> String {
        let pick = |candidates: Vec<&Series>| -> Option<String> {
            candidates
                .into_iter()
                .min_by(|a, b| {
                    b.slice_count()
                        .cmp(&a.slice_count())
                        .then_with(|| a.series_number.cmp(&b.series_number))
                })
                .map(|s| s.series_uid.clone())
        };

        let axial: Vec<&Series> = series
            .iter()
            .filter(|s| s.plane == AnatomicalPlane::Axial)
            .collect();
        pick(axial)
            .or_else(|| pick(series.iter().collect()))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use slicewise_core::ImageHandle;

    const AXIAL: [f64; 6] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    const SAGITTAL: [f64; 6] = [0.0, 1.0, 0.0, 0.0, 0.0, -1.0];

    fn record(uid: &str, number: i32, instance: i32, position: [f64; 3], orientation: [f64; 6]) -> RawInstanceRecord {
        RawInstanceRecord {
            series_instance_uid: Some(uid.to_string()),
            series_number: Some(number),
            series_description: Some(format!("desc {}", number)),
            modality: Some("CT".to_string()),
            study_description: Some("CT CHEST".to_string()),
            study_date: Some("20240115".to_string()),
            instance_number: Some(instance),
            image_position: Some(position),
            image_orientation: Some(orientation),
            image: ImageHandle::new(format!("{}/{}", uid, instance)),
            ..Default::default()
        }
    }

    fn axial_series(uid: &str, number: i32, count: i32) -> Vec<RawInstanceRecord> {
        (1..=count)
            .map(|i| record(uid, number, i, [0.0, 0.0, -(i as f64) * 2.5], AXIAL))
            .collect()
    }

    #[test]
    fn test_empty_input() {
        let study = StudyModelBuilder::new().build(&[]);
        assert!(study.is_empty());
        assert!(study.primary_series_uid.is_empty());
        assert!(study.primary_series().is_none());
    }

    #[test]
    fn test_sorts_by_varying_coordinate() {
        let mut records = axial_series("1.1", 2, 5);
        records.reverse();
        let study = StudyModelBuilder::new().build(&records);
        let series = &study.series[0];

        assert_eq!(series.sort_axis, Some(SpatialAxis::Z));
        let z: Vec<f64> = series.slices.iter().map(|s| s.position[2]).collect();
        assert!(z.windows(2).all(|w| w[0] <= w[1]));
        // z 递增即实例号递减
        assert_eq!(series.slices[0].instance_number, 5);
        assert_eq!(series.instance_bounds().start, 1);
        assert_eq!(series.instance_bounds().end, 5);
        assert!((series.coverage_mm() - 10.0).abs() < 1e-9);
        assert_eq!(study.study_date, NaiveDate::from_ymd_opt(2024, 1, 15));
    }

    #[test]
    fn test_single_plane_falls_back_to_instance_number() {
        let records: Vec<_> = [3, 1, 2]
            .into_iter()
            .map(|i| record("scout", 1, i, [0.0, 0.0, 0.0], AXIAL))
            .collect();
        let study = StudyModelBuilder::new().build(&records);
        let series = &study.series[0];

        assert_eq!(series.sort_axis, None);
        let order: Vec<i32> = series.slices.iter().map(|s| s.instance_number).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_primary_prefers_largest_axial() {
        let mut records = axial_series("axial-small", 3, 10);
        records.extend(axial_series("axial-large", 5, 40));
        records.extend(
            (1..=60).map(|i| record("sag", 2, i, [i as f64, 0.0, 0.0], SAGITTAL)),
        );
        let study = StudyModelBuilder::new().build(&records);

        let numbers: Vec<i32> = study.series.iter().map(|s| s.series_number).collect();
        assert_eq!(numbers, vec![2, 3, 5]);
        assert_eq!(study.primary_series_uid, "axial-large");
        assert_eq!(study.series[0].plane, AnatomicalPlane::Sagittal);
        assert_eq!(study.series[0].sort_axis, Some(SpatialAxis::X));
    }

    #[test]
    fn test_primary_tie_breaks_on_series_number() {
        let mut records = axial_series("b", 7, 20);
        records.extend(axial_series("a", 4, 20));
        let study = StudyModelBuilder::new().build(&records);
        assert_eq!(study.primary_series().map(|s| s.series_number), Some(4));
    }

    #[test]
    fn test_primary_without_axial_uses_largest() {
        let mut records: Vec<_> = (1..=8)
            .map(|i| record("sag-a", 6, i, [i as f64, 0.0, 0.0], SAGITTAL))
            .collect();
        records.extend((1..=12).map(|i| record("sag-b", 9, i, [i as f64, 0.0, 0.0], SAGITTAL)));
        let study = StudyModelBuilder::new().build(&records);
        assert_eq!(study.primary_series_uid, "sag-b");
    }
}
