//! Function signatures: named, typed inputs and outputs used to check the
//! data flowing through Simple nodes and to rename output entries so that
//! they line up with the next function's inputs.

use crate::error::{Result, WorkflowError};
use crate::types::Params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Data type of a signature parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int,
    Float,
    Bool,
    Text,
    ArrayInt,
    ArrayFloat,
    ArrayBool,
    ArrayText,
    ArrayArrayInt,
    ArrayArrayFloat,
    Void,
}

impl DataType {
    /// Whether `value` is acceptable for this type. Numeric and boolean
    /// types also accept strings that parse as such; array types accept a
    /// single element of the inner type.
    pub fn type_check(self, value: &Value) -> bool {
        match self {
            Self::Void => true,
            Self::Int => match value {
                Value::Number(_) => true,
                Value::String(s) => s.parse::<i64>().is_ok(),
                _ => false,
            },
            Self::Float => match value {
                Value::Number(_) => true,
                Value::String(s) => s.parse::<f64>().is_ok(),
                _ => false,
            },
            Self::Bool => match value {
                Value::Bool(_) => true,
                Value::Number(n) => n.as_i64() == Some(0) || n.as_i64() == Some(1),
                Value::String(s) => matches!(s.as_str(), "true" | "True" | "false" | "False" | "1" | "0"),
                _ => false,
            },
            Self::Text => value.is_string(),
            Self::ArrayInt => check_elements(Self::Int, value),
            Self::ArrayFloat => check_elements(Self::Float, value),
            Self::ArrayBool => check_elements(Self::Bool, value),
            Self::ArrayText => check_elements(Self::Text, value),
            Self::ArrayArrayInt => check_elements(Self::ArrayInt, value),
            Self::ArrayArrayFloat => check_elements(Self::ArrayFloat, value),
        }
    }
}

fn check_elements(inner: DataType, value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().all(|item| inner.type_check(item)),
        single => inner.type_check(single),
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A named, typed parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

impl ParamDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }

    fn check(&self, map: &Params) -> std::result::Result<(), String> {
        match map.get(&self.name) {
            None => Err(format!("no entry named '{}' of type {}", self.name, self.data_type)),
            Some(v) if !self.data_type.type_check(v) => Err(format!(
                "entry '{}' should be {} but is {}",
                self.name, self.data_type, v
            )),
            Some(_) => Ok(()),
        }
    }
}

/// Declared inputs and outputs of a function
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default)]
    pub inputs: Vec<ParamDef>,
    #[serde(default)]
    pub outputs: Vec<ParamDef>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.inputs.push(ParamDef::new(name, data_type));
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.outputs.push(ParamDef::new(name, data_type));
        self
    }

    /// Every declared input must be present and type-check. Extra entries
    /// are allowed since later functions may need them.
    pub fn check_inputs(&self, function: &str, input: &Params) -> Result<()> {
        check_all(function, &self.inputs, input)
    }

    pub fn check_outputs(&self, function: &str, output: &Params) -> Result<()> {
        check_all(function, &self.outputs, output)
    }

    /// Rename entries of `output` so that they satisfy the inputs of `next`.
    /// An input already present by name is left alone; otherwise the first
    /// entry that type-checks is moved under the input's name.
    pub fn map_output(output: &mut Params, next_function: &str, next: &Signature) -> Result<()> {
        for def in &next.inputs {
            if output.contains_key(&def.name) {
                continue;
            }
            let key = output
                .iter()
                .find(|(_, v)| def.data_type.type_check(v))
                .map(|(k, _)| k.clone())
                .ok_or_else(|| WorkflowError::SignatureMismatch {
                    function: next_function.to_string(),
                    reason: format!(
                        "no output entry type-checks with input '{}' of type {}",
                        def.name, def.data_type
                    ),
                })?;
            if let Some(value) = output.remove(&key) {
                output.insert(def.name.clone(), value);
            }
        }
        Ok(())
    }
}

fn check_all(function: &str, defs: &[ParamDef], map: &Params) -> Result<()> {
    let errors: Vec<String> = defs.iter().filter_map(|d| d.check(map).err()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(WorkflowError::SignatureMismatch {
            function: function.to_string(),
            reason: errors.join("; "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_type_checks() {
        assert!(DataType::Int.type_check(&json!(3)));
        assert!(DataType::Int.type_check(&json!("12")));
        assert!(!DataType::Int.type_check(&json!("twelve")));
        assert!(DataType::Bool.type_check(&json!("True")));
        assert!(!DataType::Text.type_check(&json!(1)));
        assert!(DataType::ArrayInt.type_check(&json!([1, 2, 3])));
        assert!(!DataType::ArrayInt.type_check(&json!([1, "x"])));
        assert!(DataType::ArrayArrayFloat.type_check(&json!([[1.5], [2.0, 3]])));
    }

    #[test]
    fn test_check_inputs_reports_missing_entries() {
        let sig = Signature::new().with_input("input", DataType::Int);
        assert!(sig.check_inputs("inc", &params(json!({"input": 1, "extra": "ok"}))).is_ok());

        let err = sig.check_inputs("inc", &params(json!({"other": 1}))).unwrap_err();
        assert!(matches!(err, WorkflowError::SignatureMismatch { .. }));
    }

    #[test]
    fn test_map_output_renames_matching_entry() {
        let next = Signature::new()
            .with_input("input", DataType::Int)
            .with_output("result", DataType::Int);
        let mut output = params(json!({"result": 2}));

        Signature::map_output(&mut output, "inc", &next).unwrap();
        assert_eq!(output, params(json!({"input": 2})));
    }

    #[test]
    fn test_map_output_fails_without_candidate() {
        let next = Signature::new().with_input("flag", DataType::Bool);
        let mut output = params(json!({"name": "ada"}));

        let err = Signature::map_output(&mut output, "toggle", &next).unwrap_err();
        assert!(err.to_string().contains("toggle"));
    }

    #[test]
    fn test_signature_json_shape() {
        let sig: Signature = serde_json::from_value(json!({
            "inputs": [{"name": "n", "type": "Int"}],
            "outputs": [{"name": "words", "type": "ArrayText"}]
        }))
        .unwrap();
        assert_eq!(sig.inputs[0].data_type, DataType::Int);
        assert_eq!(sig.outputs[0].data_type, DataType::ArrayText);
    }
}
