//! DICOM文件解析器
//!
//! 只提取构建检查模型所需的标签，不解码像素数据

use crate::record::RawInstanceRecord;
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::{open_file, InMemDicomObject};
use slicewise_core::utils::non_empty;
use slicewise_core::{AcquisitionParams, ImageHandle, Result, SlicewiseError};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// DICOM文件解析器
#[derive(Debug, Default)]
pub struct DicomParser;

impl DicomParser {
    /// 创建新的DICOM解析器
    pub fn new() -> Self {
        Self
    }

    /// 解析单个DICOM文件，图像句柄为文件路径
    pub fn parse_file<P: AsRef<Path>>(&self, file_path: P) -> Result<RawInstanceRecord> {
        let file_path = file_path.as_ref();
        debug!("解析DICOM文件: {:?}", file_path);

        let obj = open_file(file_path).map_err(|e| {
            SlicewiseError::Dicom(format!("无法解析DICOM文件 {:?}: {}", file_path, e))
        })?;

        Ok(Self::extract_record(
            &obj,
            ImageHandle::new(file_path.to_string_lossy()),
        ))
    }

    /// 批量解析，无法解析的文件跳过并记录
    pub fn parse_files<P: AsRef<Path>>(
        &self,
        paths: &[P],
    ) -> (Vec<RawInstanceRecord>, Vec<(PathBuf, SlicewiseError)>) {
        let mut records = Vec::with_capacity(paths.len());
        let mut failures = Vec::new();

        for path in paths {
            match self.parse_file(path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("跳过无法解析的文件 {:?}: {}", path.as_ref(), e);
                    failures.push((path.as_ref().to_path_buf(), e));
                }
            }
        }

        info!("DICOM解析完成: 成功 {}, 失败 {}", records.len(), failures.len());
        (records, failures)
    }

    /// 从DICOM对象中提取记录
    pub fn extract_record(obj: &InMemDicomObject, image: ImageHandle) -> RawInstanceRecord {
        let acquisition = AcquisitionParams {
            slice_thickness: Self::get_float(obj, tags::SLICE_THICKNESS),
            spacing_between_slices: Self::get_float(obj, tags::SPACING_BETWEEN_SLICES),
            convolution_kernel: Self::get_string(obj, tags::CONVOLUTION_KERNEL),
            rows: Self::get_int(obj, tags::ROWS).and_then(|v| u32::try_from(v).ok()),
            columns: Self::get_int(obj, tags::COLUMNS).and_then(|v| u32::try_from(v).ok()),
            pixel_spacing: Self::get_floats::<2>(obj, tags::PIXEL_SPACING),
            kvp: Self::get_float(obj, tags::KVP),
            contrast_agent: Self::get_string(obj, tags::CONTRAST_BOLUS_AGENT),
            magnetic_field_strength: Self::get_float(obj, tags::MAGNETIC_FIELD_STRENGTH),
            echo_time: Self::get_float(obj, tags::ECHO_TIME),
            repetition_time: Self::get_float(obj, tags::REPETITION_TIME),
        };

        RawInstanceRecord {
            study_description: Self::get_string(obj, tags::STUDY_DESCRIPTION),
            study_date: Self::get_string(obj, tags::STUDY_DATE),
            patient_age: Self::get_string(obj, tags::PATIENT_AGE),
            patient_sex: Self::get_string(obj, tags::PATIENT_SEX),
            institution_name: Self::get_string(obj, tags::INSTITUTION_NAME),
            manufacturer: Self::get_string(obj, tags::MANUFACTURER),
            manufacturer_model_name: Self::get_string(obj, tags::MANUFACTURER_MODEL_NAME),
            series_instance_uid: Self::get_string(obj, tags::SERIES_INSTANCE_UID),
            series_number: Self::get_int(obj, tags::SERIES_NUMBER),
            series_description: Self::get_string(obj, tags::SERIES_DESCRIPTION),
            modality: Self::get_string(obj, tags::MODALITY),
            // 多值窗只取第一组
            window_center: Self::get_first_float(obj, tags::WINDOW_CENTER),
            window_width: Self::get_first_float(obj, tags::WINDOW_WIDTH),
            acquisition,
            instance_number: Self::get_int(obj, tags::INSTANCE_NUMBER),
            image_position: Self::get_floats::<3>(obj, tags::IMAGE_POSITION_PATIENT),
            image_orientation: Self::get_floats::<6>(obj, tags::IMAGE_ORIENTATION_PATIENT),
            slice_location: Self::get_float(obj, tags::SLICE_LOCATION),
            image,
        }
    }

    /// 获取字符串类型元素的值
    fn get_string(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
        non_empty(
            obj.element(tag)
                .ok()
                .and_then(|element| element.to_str().ok())
                .map(|s| s.to_string()),
        )
    }

    /// 获取整数类型元素的值
    fn get_int(obj: &InMemDicomObject, tag: Tag) -> Option<i32> {
        obj.element(tag)
            .ok()
            .and_then(|element| element.to_int::<i32>().ok())
    }

    fn get_float(obj: &InMemDicomObject, tag: Tag) -> Option<f64> {
        obj.element(tag)
            .ok()
            .and_then(|element| element.to_float64().ok())
            .filter(|v| v.is_finite())
    }

    fn get_first_float(obj: &InMemDicomObject, tag: Tag) -> Option<f64> {
        obj.element(tag)
            .ok()
            .and_then(|element| element.to_multi_float64().ok())
            .and_then(|values| values.first().copied())
            .filter(|v| v.is_finite())
    }

    /// 获取定长多值浮点元素，个数不符时视为缺失
    fn get_floats<const N: usize>(obj: &InMemDicomObject, tag: Tag) -> Option<[f64; N]> {
        let values = obj.element(tag).ok()?.to_multi_float64().ok()?;
        let array: [f64; N] = values.try_into().ok()?;
        if array.iter().all(|v| v.is_finite()) {
            Some(array)
        } else {
            debug!("标签 {:?} 含有非有限值", tag);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::core::{dicom_value, DataElement, PrimitiveValue, VR};

    fn sample_object() -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.840.1")),
            DataElement::new(tags::SERIES_NUMBER, VR::IS, PrimitiveValue::from("3")),
            DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, PrimitiveValue::from("AX T2 ")),
            DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("MR")),
            DataElement::new(tags::INSTANCE_NUMBER, VR::IS, PrimitiveValue::from("17")),
            DataElement::new(
                tags::IMAGE_POSITION_PATIENT,
                VR::DS,
                dicom_value!(Strs, ["-120.5", "-98.0", "42.25"]),
            ),
            DataElement::new(
                tags::IMAGE_ORIENTATION_PATIENT,
                VR::DS,
                dicom_value!(Strs, ["1", "0", "0", "0", "1", "0"]),
            ),
            DataElement::new(tags::WINDOW_CENTER, VR::DS, dicom_value!(Strs, ["300", "600"])),
            DataElement::new(tags::WINDOW_WIDTH, VR::DS, dicom_value!(Strs, ["800", "1200"])),
            DataElement::new(tags::SLICE_THICKNESS, VR::DS, PrimitiveValue::from("3.0")),
        ])
    }

    #[test]
    fn test_extract_record() {
        let record = DicomParser::extract_record(&sample_object(), ImageHandle::new("a.dcm"));

        assert_eq!(record.series_key(), "1.2.840.1");
        assert_eq!(record.series_number, Some(3));
        assert_eq!(record.series_description.as_deref(), Some("AX T2"));
        assert_eq!(record.instance_number, Some(17));
        assert_eq!(record.image_position, Some([-120.5, -98.0, 42.25]));
        assert_eq!(record.image_orientation, Some([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]));
        assert_eq!(record.window_center, Some(300.0));
        assert_eq!(record.window_width, Some(800.0));
        assert_eq!(record.acquisition.slice_thickness, Some(3.0));
        assert!(record.study_date.is_none());
    }

    #[test]
    fn test_wrong_multiplicity_is_missing() {
        let obj = InMemDicomObject::from_element_iter([DataElement::new(
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            dicom_value!(Strs, ["1.0", "2.0"]),
        )]);
        let record = DicomParser::extract_record(&obj, ImageHandle::new("b.dcm"));
        assert!(record.image_position.is_none());
    }

    #[test]
    fn test_parse_missing_file() {
        let result = DicomParser::new().parse_file("/nonexistent/file.dcm");
        assert!(matches!(result, Err(SlicewiseError::Dicom(_))));
    }
}
