//! 选片方案解析
//!
//! 推理服务的输出是自由格式的键值数据，这里先识别其形态，再校验必填字段并规整为 [`SelectionPlan`]。
//! 缺少序列号或切片范围属于硬性错误，不做静默默认。

use serde_json::{Map, Value};
use slicewise_core::utils::parse_number;
use slicewise_core::{
    InstanceRange, Result, SamplingStrategy, SelectionPlan, SeriesRole, SeriesSelection,
    SlicewiseError, Study, WindowLevel,
};
use tracing::{debug, warn};

/// 服务输出中的单个选片，字段尚未校验
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSelection {
    pub series_number: Option<String>,
    pub role: Option<String>,
    pub rationale: Option<String>,
    pub slice_range: Option<Value>,
    pub sampling_strategy: Option<String>,
    pub sampling_param: Option<f64>,
    pub window_center: Option<f64>,
    pub window_width: Option<f64>,
}

/// 服务输出的可识别形态
#[derive(Debug, Clone, PartialEq)]
pub enum RawPlanResponse {
    /// `{ reasoning, selections: [...] }`
    MultiSeries {
        reasoning: String,
        selections: Vec<RawSelection>,
    },
    /// 旧版单序列形态：选片字段直接位于顶层
    SingleSeries {
        reasoning: String,
        selection: RawSelection,
    },
    /// 无法识别
    Unparseable { reason: String },
}

impl RawPlanResponse {
    /// 识别服务输出的形态
    pub fn classify(value: &Value) -> Self {
        match value {
            Value::String(text) => match extract_json_object(text) {
                Some(inner) => Self::classify(&inner),
                None => Self::Unparseable {
                    reason: "服务输出中没有可解析的JSON对象".to_string(),
                },
            },
            Value::Object(map) => Self::classify_object(map),
            other => Self::Unparseable {
                reason: format!("服务输出不是JSON对象: {}", type_name(other)),
            },
        }
    }

    fn classify_object(map: &Map<String, Value>) -> Self {
        let reasoning = field(map, &["reasoning", "overallRationale"])
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if let Some(list) = field(map, &["selections"]) {
            let Some(items) = list.as_array() else {
                return Self::Unparseable {
                    reason: "selections 不是数组".to_string(),
                };
            };
            let selections: Vec<RawSelection> = items
                .iter()
                .filter_map(Value::as_object)
                .map(RawSelection::from_object)
                .collect();
            if selections.len() != items.len() {
                warn!("忽略 {} 个非对象的选片项", items.len() - selections.len());
            }
            return Self::MultiSeries {
                reasoning,
                selections,
            };
        }

        if field(map, SERIES_KEYS).is_some() || field(map, RANGE_KEYS).is_some() {
            return Self::SingleSeries {
                reasoning,
                selection: RawSelection::from_object(map),
            };
        }

        Self::Unparseable {
            reason: "缺少 selections 或 seriesNumber/sliceRange 字段".to_string(),
        }
    }

    /// 校验并转换为类型化的选片方案
    pub fn into_plan(self, study: &Study) -> Result<SelectionPlan> {
        let (reasoning, raws) = match self {
            Self::MultiSeries {
                reasoning,
                selections,
            } => (reasoning, selections),
            Self::SingleSeries {
                reasoning,
                selection,
            } => (reasoning, vec![selection]),
            Self::Unparseable { reason } => {
                return Err(SlicewiseError::MalformedPlanResponse(reason))
            }
        };

        if raws.is_empty() {
            return Err(SlicewiseError::MalformedPlanResponse(
                "selections 为空".to_string(),
            ));
        }

        let mut selections = raws
            .into_iter()
            .enumerate()
            .map(|(i, raw)| raw.into_selection(i, study))
            .collect::<Result<Vec<_>>>()?;
        order_primary_first(&mut selections);

        Ok(SelectionPlan::new(reasoning, selections))
    }
}

const SERIES_KEYS: &[&str] = &["seriesNumber", "series_number", "series"];
const RANGE_KEYS: &[&str] = &["sliceRange", "slice_range", "range"];

impl RawSelection {
    fn from_object(map: &Map<String, Value>) -> Self {
        Self {
            series_number: field(map, SERIES_KEYS).and_then(as_series_number),
            role: field(map, &["role"]).and_then(Value::as_str).map(str::to_string),
            rationale: field(map, &["rationale", "reason"])
                .and_then(Value::as_str)
                .map(str::to_string),
            slice_range: field(map, RANGE_KEYS).cloned(),
            sampling_strategy: field(map, &["samplingStrategy", "sampling_strategy", "strategy"])
                .and_then(Value::as_str)
                .map(str::to_string),
            sampling_param: field(map, &["samplingParam", "sampling_param"]).and_then(as_number),
            window_center: field(map, &["windowCenter", "window_center"]).and_then(as_number),
            window_width: field(map, &["windowWidth", "window_width"]).and_then(as_number),
        }
    }

    fn into_selection(self, index: usize, study: &Study) -> Result<SeriesSelection> {
        let ordinal = index + 1;
        let series_number = self.series_number.ok_or_else(|| {
            SlicewiseError::MalformedPlanResponse(format!("第 {} 个选片缺少 seriesNumber", ordinal))
        })?;
        let slice_range = parse_range(self.slice_range.as_ref()).ok_or_else(|| {
            SlicewiseError::MalformedPlanResponse(format!(
                "第 {} 个选片的 sliceRange 缺失或不是数值对",
                ordinal
            ))
        })?;

        let role = match self.role.as_deref().map(str::trim) {
            Some(r) if r.eq_ignore_ascii_case("primary") => SeriesRole::Primary,
            Some(r) if r.eq_ignore_ascii_case("supplementary") || r.eq_ignore_ascii_case("secondary") => {
                SeriesRole::Supplementary
            }
            _ if index == 0 => SeriesRole::Primary,
            _ => SeriesRole::Supplementary,
        };

        let sampling_strategy = match self.sampling_strategy.as_deref() {
            Some(raw) => SamplingStrategy::parse(raw).unwrap_or_else(|| {
                warn!("未知采样策略 {:?}，按 all 处理", raw);
                SamplingStrategy::All
            }),
            None => SamplingStrategy::All,
        };

        let window = match (self.window_center, self.window_width) {
            (Some(center), Some(width)) if width > 0.0 => WindowLevel::new(center, width),
            _ => {
                debug!("序列 {} 未给出有效窗宽窗位，使用默认值", series_number);
                study
                    .find_series(&series_number)
                    .map(|s| s.effective_window())
                    .unwrap_or_else(|| WindowLevel::preset_for_modality(&study.modality))
            }
        };

        Ok(SeriesSelection {
            series_number,
            role,
            rationale: self.rationale.unwrap_or_default(),
            slice_range,
            sampling_strategy,
            sampling_param: self.sampling_param.map(|p| p.round() as i32),
            window_center: window.center,
            window_width: window.width,
        })
    }
}

/// 解析服务输出为选片方案
pub fn parse_selection_plan(raw: &Value, study: &Study) -> Result<SelectionPlan> {
    let response = RawPlanResponse::classify(raw);
    if let RawPlanResponse::Unparseable { reason } = &response {
        warn!("选片方案无法识别: {}", reason);
    }
    let plan = response.into_plan(study)?;
    debug!(
        "选片方案解析完成: {} 个选片, 预估 {} 张",
        plan.selections.len(),
        plan.total_images
    );
    Ok(plan)
}

/// 保证第一项为主序列：有主序列时移到最前，没有时把第一项标为主序列
fn order_primary_first(selections: &mut Vec<SeriesSelection>) {
    if selections.first().is_some_and(SeriesSelection::is_primary) {
        return;
    }
    match selections.iter().position(SeriesSelection::is_primary) {
        Some(pos) => {
            let primary = selections.remove(pos);
            selections.insert(0, primary);
        }
        None => {
            if let Some(first) = selections.first_mut() {
                first.role = SeriesRole::Primary;
            }
        }
    }
}

/// 从文本中取出JSON对象，兼容 ```json 代码块和前后说明文字
fn extract_json_object(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        return value.is_object().then_some(value);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn field<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find(|value| !value.is_null())
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

fn as_series_number(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 => Some(format!("{}", f as i64)),
            _ => Some(n.to_string()),
        },
        _ => None,
    }
}

fn parse_range(value: Option<&Value>) -> Option<InstanceRange> {
    let items = value?.as_array()?;
    if items.len() != 2 {
        return None;
    }
    let start = as_number(&items[0])?;
    let end = as_number(&items[1])?;
    Some(InstanceRange::new(start.round() as i32, end.round() as i32))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
