//! 行存储查询接口（外部协作者）
//!
//! 抽象 `select / insert / update(table, filter, order, range)`，
//! 由 [`crate::infra::rest::RestClient`]（PostgREST）和
//! [`crate::infra::memory::MemoryStore`]（测试 / 演示）实现。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;

use crate::error::Result;

/// 过滤条件
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { column: String, value: Value },
    Neq { column: String, value: Value },
    In { column: String, values: Vec<Value> },
    NotIn { column: String, values: Vec<Value> },
    IsNull { column: String },
    Lte { column: String, value: Value },
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq { column: column.to_string(), value: value.into() }
    }

    pub fn neq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Neq { column: column.to_string(), value: value.into() }
    }

    pub fn is_in<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In {
            column: column.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn not_in<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::NotIn {
            column: column.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(column: &str) -> Self {
        Filter::IsNull { column: column.to_string() }
    }

    pub fn lte(column: &str, value: impl Into<Value>) -> Self {
        Filter::Lte { column: column.to_string(), value: value.into() }
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq { column, .. }
            | Filter::Neq { column, .. }
            | Filter::In { column, .. }
            | Filter::NotIn { column, .. }
            | Filter::IsNull { column }
            | Filter::Lte { column, .. } => column,
        }
    }

    /// 判断一行是否满足条件（内存实现与实时频道过滤共用）
    pub fn matches(&self, row: &Value) -> bool {
        let field = row.get(self.column()).unwrap_or(&Value::Null);
        match self {
            Filter::Eq { value, .. } => compare_values(field, value) == Some(Ordering::Equal),
            Filter::Neq { value, .. } => compare_values(field, value) != Some(Ordering::Equal),
            Filter::In { values, .. } => values
                .iter()
                .any(|v| compare_values(field, v) == Some(Ordering::Equal)),
            Filter::NotIn { values, .. } => !values
                .iter()
                .any(|v| compare_values(field, v) == Some(Ordering::Equal)),
            Filter::IsNull { .. } => field.is_null(),
            Filter::Lte { value, .. } => matches!(
                compare_values(field, value),
                Some(Ordering::Less) | Some(Ordering::Equal)
            ),
        }
    }

    /// PostgREST 查询参数形式：`(column, "op.value")`
    pub fn to_query_param(&self) -> (String, String) {
        let column = self.column().to_string();
        let op = match self {
            Filter::Eq { value, .. } => format!("eq.{}", scalar(value)),
            Filter::Neq { value, .. } => format!("neq.{}", scalar(value)),
            Filter::In { values, .. } => format!("in.({})", list(values)),
            Filter::NotIn { values, .. } => format!("not.in.({})", list(values)),
            Filter::IsNull { .. } => "is.null".to_string(),
            Filter::Lte { value, .. } => format!("lte.{}", scalar(value)),
        };
        (column, op)
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn list(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| format!("\"{}\"", scalar(v).replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",")
}

/// 比较两个 JSON 标量；时间戳字符串按时间比较
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => {
            match (
                x.parse::<DateTime<Utc>>(),
                y.parse::<DateTime<Utc>>(),
            ) {
                (Ok(tx), Ok(ty)) => Some(tx.cmp(&ty)),
                _ => Some(x.cmp(y)),
            }
        }
        _ => None,
    }
}

/// 排序
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// 查询描述
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    /// 闭区间 `[from, to]`（与 PostgREST Range 头一致）
    pub range: Option<(usize, usize)>,
}

impl Query {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: "*".to_string(),
            filters: Vec::new(),
            order: Vec::new(),
            range: None,
        }
    }

    pub fn columns(mut self, columns: &str) -> Self {
        self.columns = columns.to_string();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order.push(Order { column: column.to_string(), ascending: false });
        self
    }

    pub fn order_asc(mut self, column: &str) -> Self {
        self.order.push(Order { column: column.to_string(), ascending: true });
        self
    }

    pub fn range(mut self, from: usize, to: usize) -> Self {
        self.range = Some((from, to));
        self
    }

    /// 按 order 比较两行（内存实现使用）
    pub fn compare_rows(&self, a: &Value, b: &Value) -> Ordering {
        for order in &self.order {
            let left = a.get(&order.column).unwrap_or(&Value::Null);
            let right = b.get(&order.column).unwrap_or(&Value::Null);
            let ordering = compare_values(left, right).unwrap_or(Ordering::Equal);
            let ordering = if order.ascending { ordering } else { ordering.reverse() };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// 查询协作者
#[async_trait]
pub trait QueryClient: Send + Sync {
    /// 查询行
    async fn select(&self, query: &Query) -> Result<Vec<Value>>;

    /// 插入一行，返回服务端写入后的行
    async fn insert(&self, table: &str, row: Value) -> Result<Value>;

    /// 按条件更新，返回被更新的行
    async fn update(&self, table: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>>;
}
