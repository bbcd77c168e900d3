//! 测试用检查构造工具

use slicewise_core::{
    AcquisitionParams, AnatomicalPlane, ImageHandle, Series, Slice, Study, WindowLevel,
};

/// 序列描述：实例号从 `first_instance` 开始连续编号，层间距 1mm
#[derive(Debug, Clone)]
pub struct SeriesSpec {
    pub number: i32,
    pub count: i32,
    pub first_instance: i32,
    pub plane: AnatomicalPlane,
    pub window: Option<WindowLevel>,
    pub description: Option<String>,
}

impl SeriesSpec {
    pub fn axial(number: i32, count: i32) -> Self {
        Self {
            number,
            count,
            first_instance: 1,
            plane: AnatomicalPlane::Axial,
            window: None,
            description: None,
        }
    }

    pub fn sagittal(number: i32, count: i32) -> Self {
        Self {
            plane: AnatomicalPlane::Sagittal,
            ..Self::axial(number, count)
        }
    }

    pub fn with_window(mut self, center: f64, width: f64) -> Self {
        self.window = Some(WindowLevel::new(center, width));
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn build(&self) -> Series {
        let axis = self.plane.axis();
        let slices: Vec<Slice> = (0..self.count)
            .map(|i| {
                let instance_number = self.first_instance + i;
                let mut position = [10.0, 20.0, 30.0];
                position[axis.index()] = i as f64;
                Slice {
                    instance_number,
                    position,
                    orientation: None,
                    slice_location: None,
                    image: ImageHandle::new(format!("s{}/{}", self.number, instance_number)),
                }
            })
            .collect();

        Series {
            series_uid: format!("uid-{}", self.number),
            series_number: self.number,
            description: self
                .description
                .clone()
                .unwrap_or_else(|| format!("desc{}", self.number)),
            modality: "CT".to_string(),
            default_window: self.window,
            acquisition: AcquisitionParams::default(),
            plane: self.plane,
            sort_axis: Some(axis),
            coordinate_min: 0.0,
            coordinate_max: (self.count - 1).max(0) as f64,
            instance_min: self.first_instance,
            instance_max: self.first_instance + self.count - 1,
            slices,
        }
    }
}

/// 由序列描述构造检查，第一个序列为主序列
pub fn study_with(specs: &[SeriesSpec]) -> Study {
    let series: Vec<Series> = specs.iter().map(SeriesSpec::build).collect();
    Study {
        description: "TEST".to_string(),
        modality: "CT".to_string(),
        primary_series_uid: series.first().map(|s| s.series_uid.clone()).unwrap_or_default(),
        series,
        ..Default::default()
    }
}

