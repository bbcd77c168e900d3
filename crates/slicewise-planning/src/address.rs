//! 切片寻址
//!
//! 为每张导出图像生成可读标签，并把分析文本中的切片引用解析回具体图像。
//! 支持两种互不混用的引用写法：
//! - 实例号引用：`image 42`、`img 40-45`、`instance 12/120`、`slice 42/120`（slice 必须带总数）
//! - 发送位置引用：`slice 3`、`#3`、`slice 2-4`，指本次发送图像中从1开始的位置
//!
//! 同一段文本同时命中两种写法时以实例号引用为准。
//! 紧跟在 `Series N` 之后的括号内容是序列描述，其中的文字不当作引用。

use regex::Regex;
use serde::{Deserialize, Serialize};
use slicewise_core::{Series, Slice, SliceMapping};
use std::ops::Range;
use std::sync::LazyLock;
use tracing::debug;

static INSTANCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:image|img|instance|im)\s*#?\s*(\d+)(?:\s*[-–~]\s*(\d+))?(?:\s*/\s*(\d+))?")
        .expect("instance pattern")
});

static SLICE_TOTAL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bslice\s*(\d+)(?:\s*[-–~]\s*(\d+))?\s*/\s*(\d+)").expect("slice total pattern")
});

static POSITION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\bslice\s*|#)(\d+)(?:\s*[-–~]\s*(\d+))?").expect("position pattern")
});

static SERIES_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bseries\s*#?\s*(\d+)").expect("series pattern"));

/// 引用类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    /// 真实实例号
    Instance,
    /// 发送图像中的位置（从1开始）
    Position,
}

/// 文本中的一处切片引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceReference {
    pub kind: ReferenceKind,
    /// 归一化后的起止值，start <= end
    pub start: i32,
    pub end: i32,
    /// `/T` 后缀给出的序列总张数
    pub total: Option<i32>,
    /// 同一行前文提到的序列号
    pub series: Option<i32>,
    /// 引用在原文中的字节区间
    pub span: Range<usize>,
}

impl SliceReference {
    pub fn midpoint(&self) -> f64 {
        (self.start as f64 + self.end as f64) / 2.0
    }

    pub fn contains(&self, value: i32) -> bool {
        value >= self.start && value <= self.end
    }
}

/// 切片地址解析器
#[derive(Debug, Default, Clone)]
pub struct SliceAddressResolver;

impl SliceAddressResolver {
    pub fn new() -> Self {
        Self
    }

    /// 生成图像标签，例如 `Series 3 (AX T2) image 17/40 z=12.5mm`
    pub fn build_label(&self, series: &Series, slice: &Slice) -> String {
        let axis = series.plane.axis();
        format!(
            "{} image {}/{} {}={:.1}mm",
            series.display_name(),
            slice.instance_number,
            series.slice_count(),
            axis.label(),
            slice.coordinate(axis)
        )
    }

    /// 为一个序列实际导出成功的切片生成映射，位置从 `start_position` 起连续编号
    pub fn build_mappings(
        &self,
        series: &Series,
        slices: &[Slice],
        start_position: usize,
    ) -> Vec<SliceMapping> {
        let axis = series.plane.axis();
        slices
            .iter()
            .enumerate()
            .map(|(i, slice)| SliceMapping {
                position: start_position + i,
                instance_number: slice.instance_number,
                image: slice.image.clone(),
                coordinate: slice.coordinate(axis),
                label: self.build_label(series, slice),
                series_number: series.series_number,
                series_uid: series.series_uid.clone(),
            })
            .collect()
    }

    /// 找出文本中的全部切片引用，按出现位置排序
    pub fn find_references(&self, text: &str) -> Vec<SliceReference> {
        // 序列提及的区间包含其后的括号描述
        let mut series_mentions: Vec<(Range<usize>, i32)> = Vec::new();
        for caps in SERIES_PATTERN.captures_iter(text) {
            let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let Ok(number) = number.as_str().parse() else {
                continue;
            };
            if series_mentions.last().is_some_and(|(span, _)| span.end > whole.start()) {
                continue;
            }
            let end = description_end(text, whole.end()).unwrap_or(whole.end());
            series_mentions.push((whole.start()..end, number));
        }

        let mut references: Vec<SliceReference> = Vec::new();
        for pattern in [&*INSTANCE_PATTERN, &*SLICE_TOTAL_PATTERN] {
            for caps in pattern.captures_iter(text) {
                let Some(reference) = Self::capture(&caps, ReferenceKind::Instance, true) else {
                    continue;
                };
                if series_mentions.iter().any(|(span, _)| overlaps(span, &reference.span)) {
                    debug!("实例号引用 {:?} 位于序列描述中，忽略", &text[reference.span.clone()]);
                    continue;
                }
                references.push(reference);
            }
        }

        // 位置引用不得与实例号引用或序列提及重叠
        let occupied: Vec<Range<usize>> = references
            .iter()
            .map(|r| r.span.clone())
            .chain(series_mentions.iter().map(|(span, _)| span.clone()))
            .collect();
        for caps in POSITION_PATTERN.captures_iter(text) {
            let Some(reference) = Self::capture(&caps, ReferenceKind::Position, false) else {
                continue;
            };
            if occupied.iter().any(|span| overlaps(span, &reference.span)) {
                debug!("位置引用 {:?} 与其他引用重叠，忽略", &text[reference.span.clone()]);
                continue;
            }
            references.push(reference);
        }

        for reference in &mut references {
            let line_start = text[..reference.span.start]
                .rfind('\n')
                .map(|i| i + 1)
                .unwrap_or(0);
            reference.series = series_mentions
                .iter()
                .rev()
                .find(|(span, _)| span.start >= line_start && span.end <= reference.span.start)
                .map(|(_, number)| *number);
        }

        references.sort_by_key(|r| r.span.start);
        references
    }

    fn capture(caps: &regex::Captures<'_>, kind: ReferenceKind, with_total: bool) -> Option<SliceReference> {
        let whole = caps.get(0)?;
        let first: i32 = caps.get(1)?.as_str().parse().ok()?;
        let second: i32 = match caps.get(2) {
            Some(m) => m.as_str().parse().ok()?,
            None => first,
        };
        let total = if with_total {
            caps.get(3).and_then(|m| m.as_str().parse().ok())
        } else {
            None
        };
        Some(SliceReference {
            kind,
            start: first.min(second),
            end: first.max(second),
            total,
            series: None,
            span: whole.range(),
        })
    }

    /// 把引用解析为具体映射
    ///
    /// 实例号引用取落在范围内、最接近范围中点的映射；范围内没有时取全局最接近者。
    /// 引用带有序列号且该序列有映射时只在该序列中查找。
    /// 位置引用直接按发送位置查找，超出范围时取位置最接近者。
    pub fn resolve<'a>(
        &self,
        mappings: &'a [SliceMapping],
        reference: &SliceReference,
    ) -> Option<&'a SliceMapping> {
        match reference.kind {
            ReferenceKind::Position => {
                closest(mappings.iter(), reference, |m| m.position as i32)
            }
            ReferenceKind::Instance => {
                let scoped = reference.series.filter(|number| {
                    mappings.iter().any(|m| m.series_number == *number)
                });
                let candidates = mappings
                    .iter()
                    .filter(|m| scoped.map_or(true, |number| m.series_number == number));
                closest(candidates, reference, |m| m.instance_number)
            }
        }
    }

    /// 解析文本中的全部引用，无法解析的引用被跳过
    pub fn resolve_text<'a>(
        &self,
        mappings: &'a [SliceMapping],
        text: &str,
    ) -> Vec<(SliceReference, &'a SliceMapping)> {
        self.find_references(text)
            .into_iter()
            .filter_map(|reference| {
                let mapping = self.resolve(mappings, &reference)?;
                Some((reference, mapping))
            })
            .collect()
    }
}

/// `from` 之后紧跟的同一行括号描述的结束位置，支持嵌套括号
fn description_end(text: &str, from: usize) -> Option<usize> {
    let rest = &text[from..];
    let open = rest.len() - rest.trim_start_matches([' ', '\t']).len();
    if !rest[open..].starts_with('(') {
        return None;
    }

    let mut depth = 0usize;
    for (i, ch) in rest[open..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(from + open + i + 1);
                }
            }
            '\n' => return None,
            _ => {}
        }
    }
    None
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

/// 先在引用范围内找最接近中点者，找不到再全局找；距离相同取先出现者
fn closest<'a, I, F>(candidates: I, reference: &SliceReference, key: F) -> Option<&'a SliceMapping>
where
    I: Iterator<Item = &'a SliceMapping> + Clone,
    F: Fn(&SliceMapping) -> i32,
{
    let midpoint = reference.midpoint();
    let distance = |m: &SliceMapping| (key(m) as f64 - midpoint).abs();

    nearest(candidates.clone().filter(|m| reference.contains(key(*m))), &distance)
        .or_else(|| nearest(candidates, &distance))
}

fn nearest<'a>(
    candidates: impl Iterator<Item = &'a SliceMapping>,
    distance: &impl Fn(&SliceMapping) -> f64,
) -> Option<&'a SliceMapping> {
    candidates.fold(None, |best, m| match best {
        Some(b) if distance(b) <= distance(m) => Some(b),
        _ => Some(m),
    })
}
