//! Conversion of structured [`LabelSelector`]s into the query strings the API server accepts.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use snafu::Snafu;

type Result<T, E = SelectorError> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum SelectorError {
    #[snafu(display("label selector with binary operator {operator:?} must have values"))]
    BinaryOperatorWithoutValues { operator: String },

    #[snafu(display("label selector with unary operator {operator:?} must not have values"))]
    UnaryOperatorWithValues { operator: String },

    #[snafu(display("label selector has an invalid operator {operator:?}"))]
    InvalidOperator { operator: String },
}

/// Renders a set of labels as an equality based selector, e.g. `app=driver,tier=node`.
pub fn from_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Extends [`LabelSelector`] with a conversion into the query string format accepted by the
/// Kubernetes list API.
pub trait LabelSelectorExt {
    fn to_query_string(&self) -> Result<String>;
}

impl LabelSelectorExt for LabelSelector {
    fn to_query_string(&self) -> Result<String> {
        let mut requirements = self
            .match_labels
            .as_ref()
            .map(|labels| vec![from_labels(labels)])
            .unwrap_or_default();
        requirements.retain(|requirement| !requirement.is_empty());

        for expression in self.match_expressions.iter().flatten() {
            let values = expression.values.as_deref().unwrap_or_default();
            let operator = expression.operator.as_str();

            let requirement = match operator {
                "In" | "NotIn" if values.is_empty() => {
                    return BinaryOperatorWithoutValuesSnafu { operator }.fail();
                }
                "In" | "NotIn" => format!(
                    "{key} {op} ({values})",
                    key = expression.key,
                    op = operator.to_ascii_lowercase(),
                    values = values.join(", ")
                ),
                "Exists" | "DoesNotExist" if !values.is_empty() => {
                    return UnaryOperatorWithValuesSnafu { operator }.fail();
                }
                "Exists" => expression.key.clone(),
                "DoesNotExist" => format!("!{key}", key = expression.key),
                _ => return InvalidOperatorSnafu { operator }.fail(),
            };
            requirements.push(requirement);
        }

        Ok(requirements.join(","))
    }
}
