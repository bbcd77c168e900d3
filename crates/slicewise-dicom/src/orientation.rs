//! 方位分类
//!
//! 由 Image Orientation (Patient) 的方向余弦判定采集平面

use slicewise_core::AnatomicalPlane;

/// 行向量与列向量的叉积，即层面法向量
pub fn slice_normal(orientation: &[f64; 6]) -> [f64; 3] {
    let [rx, ry, rz, cx, cy, cz] = *orientation;
    [ry * cz - rz * cy, rz * cx - rx * cz, rx * cy - ry * cx]
}

/// 判定采集平面
///
/// 法向量绝对值最大的分量决定平面：z 为轴位，x 为矢状位，y 为冠状位。
/// 缺失、长度不足或含非有限值的输入以及并列情况一律视为轴位。
pub fn classify_plane(orientation: Option<&[f64]>) -> AnatomicalPlane {
    let Some(values) = orientation else {
        return AnatomicalPlane::Axial;
    };
    let Ok(cosines) = <[f64; 6]>::try_from(values) else {
        return AnatomicalPlane::Axial;
    };
    if cosines.iter().any(|v| !v.is_finite()) {
        return AnatomicalPlane::Axial;
    }

    let [nx, ny, nz] = slice_normal(&cosines).map(f64::abs);
    if nz >= nx && nz >= ny {
        AnatomicalPlane::Axial
    } else if nx >= ny {
        AnatomicalPlane::Sagittal
    } else {
        AnatomicalPlane::Coronal
    }
}
