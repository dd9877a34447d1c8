//! Feature derivation for model inputs.
//!
//! Validates the raw demographic/lifestyle attributes of a person and derives the
//! engineered features the expense estimator was trained on.
//!
//! **Critical for correctness**: the derivation rules and the column order of
//! [`PersonRecord::COLUMNS`] must match the training pipeline exactly to avoid
//! train/serve skew. Every threshold below is strict `<` (or `>`), with the last
//! arm catching the remainder, so each rule partitions its input without gaps.

use crate::error::{Constraint, FieldError, ValidationError};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use std::fmt;

/// Inclusive bounds for `age`.
pub const AGE_RANGE: (i64, i64) = (18, 120);

/// Inclusive bounds for `bmi`.
pub const BMI_RANGE: (f64, f64) = (15.0, 100.0);

/// Inclusive bounds for `children`.
pub const CHILDREN_RANGE: (i64, i64) = (0, 10);

/// A categorical input with a fixed set of accepted lower-case spellings.
pub trait Category: Copy + 'static {
    /// Field name used in validation reports.
    const FIELD: &'static str;

    /// Every accepted value, in the order used by error messages.
    const ALL: &'static [Self];

    fn as_str(self) -> &'static str;

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

impl Category for Sex {
    const FIELD: &'static str = "sex";
    const ALL: &'static [Self] = &[Sex::Male, Sex::Female];

    fn as_str(self) -> &'static str {
        match self {
            Sex::Male => "male",
            Sex::Female => "female",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Smoker {
    Yes,
    No,
}

impl Smoker {
    pub fn is_smoker(self) -> bool {
        self == Smoker::Yes
    }
}

impl Category for Smoker {
    const FIELD: &'static str = "smoker";
    const ALL: &'static [Self] = &[Smoker::Yes, Smoker::No];

    fn as_str(self) -> &'static str {
        match self {
            Smoker::Yes => "yes",
            Smoker::No => "no",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Northeast,
    Northwest,
    Southeast,
    Southwest,
}

impl Category for Region {
    const FIELD: &'static str = "region";
    const ALL: &'static [Self] = &[
        Region::Northeast,
        Region::Northwest,
        Region::Southeast,
        Region::Southwest,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Region::Northeast => "northeast",
            Region::Northwest => "northwest",
            Region::Southeast => "southeast",
            Region::Southwest => "southwest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeGroup {
    Young,
    Adult,
    MiddleAge,
    Senior,
}

impl AgeGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            AgeGroup::Young => "young",
            AgeGroup::Adult => "adult",
            AgeGroup::MiddleAge => "middle_age",
            AgeGroup::Senior => "senior",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifestyleRisk {
    High,
    Medium,
    LowSmoker,
    Low,
}

impl LifestyleRisk {
    pub fn as_str(self) -> &'static str {
        match self {
            LifestyleRisk::High => "high",
            LifestyleRisk::Medium => "medium",
            LifestyleRisk::LowSmoker => "low_smoker",
            LifestyleRisk::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BmiCategory {
    Underweight,
    Normal,
    Overweight,
    Obese,
}

impl BmiCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            BmiCategory::Underweight => "underweight",
            BmiCategory::Normal => "normal",
            BmiCategory::Overweight => "overweight",
            BmiCategory::Obese => "obese",
        }
    }
}

/// Compute the age bucket.
///
/// `<25` young, `<45` adult, `<65` middle_age, otherwise senior.
pub fn compute_age_group(age: u32) -> AgeGroup {
    if age < 25 {
        AgeGroup::Young
    } else if age < 45 {
        AgeGroup::Adult
    } else if age < 65 {
        AgeGroup::MiddleAge
    } else {
        AgeGroup::Senior
    }
}

/// Compute the lifestyle risk bucket from smoking status and BMI.
pub fn compute_lifestyle_risk(smoker: Smoker, bmi: f64) -> LifestyleRisk {
    let is_smoker = smoker.is_smoker();
    if is_smoker && bmi > 30.0 {
        LifestyleRisk::High
    } else if is_smoker && bmi > 25.0 {
        LifestyleRisk::Medium
    } else if is_smoker {
        LifestyleRisk::LowSmoker
    } else {
        LifestyleRisk::Low
    }
}

/// Compute the WHO-style BMI category.
///
/// `<18.5` underweight, `<25` normal, `<30` overweight, otherwise obese.
pub fn compute_bmi_category(bmi: f64) -> BmiCategory {
    if bmi < 18.5 {
        BmiCategory::Underweight
    } else if bmi < 25.0 {
        BmiCategory::Normal
    } else if bmi < 30.0 {
        BmiCategory::Overweight
    } else {
        BmiCategory::Obese
    }
}

/// Request body as received, before any type or range checks.
///
/// Fields are kept as untyped JSON so that a wrong type in one field does not
/// hide range violations in another: validation reports everything at once.
/// Only JSON objects deserialize; `null` fields count as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawPersonInput {
    pub age: Option<Value>,
    pub bmi: Option<Value>,
    pub children: Option<Value>,
    pub sex: Option<Value>,
    pub smoker: Option<Value>,
    pub region: Option<Value>,
}

impl RawPersonInput {
    /// Take the known fields out of a JSON object, ignoring any others.
    pub fn from_map(mut map: Map<String, Value>) -> Self {
        let mut take = |key: &str| map.remove(key).filter(|v| !v.is_null());
        Self {
            age: take("age"),
            bmi: take("bmi"),
            children: take("children"),
            sex: take("sex"),
            smoker: take("smoker"),
            region: take("region"),
        }
    }
}

// Derived struct visitors also accept sequences by position; go through a map.
impl<'de> Deserialize<'de> for RawPersonInput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Map::<String, Value>::deserialize(deserializer).map(Self::from_map)
    }
}

/// Validated raw attributes of one person.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PersonInput {
    age: u32,
    bmi: f64,
    children: u32,
    sex: Sex,
    smoker: Smoker,
    region: Region,
}

impl PersonInput {
    /// Build a validated input from typed values.
    ///
    /// Runs the same checks as [`PersonInput::validate`], so out-of-range numbers
    /// and unknown categories are still rejected.
    pub fn new(
        age: i64,
        bmi: f64,
        children: i64,
        sex: &str,
        smoker: &str,
        region: &str,
    ) -> Result<Self, ValidationError> {
        let bmi = Number::from_f64(bmi)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(bmi.to_string()));

        Self::validate(&RawPersonInput {
            age: Some(Value::from(age)),
            bmi: Some(bmi),
            children: Some(Value::from(children)),
            sex: Some(Value::from(sex)),
            smoker: Some(Value::from(smoker)),
            region: Some(Value::from(region)),
        })
    }

    /// Check every field of a raw input, collecting all violations.
    pub fn validate(raw: &RawPersonInput) -> Result<Self, ValidationError> {
        let mut errors = Vec::new();

        let age = check_int("age", raw.age.as_ref(), AGE_RANGE, &mut errors);
        let bmi = check_float("bmi", raw.bmi.as_ref(), BMI_RANGE, &mut errors);
        let children = check_int("children", raw.children.as_ref(), CHILDREN_RANGE, &mut errors);
        let sex = check_literal::<Sex>(raw.sex.as_ref(), &mut errors);
        let smoker = check_literal::<Smoker>(raw.smoker.as_ref(), &mut errors);
        let region = check_literal::<Region>(raw.region.as_ref(), &mut errors);

        match (age, bmi, children, sex, smoker, region) {
            (Some(age), Some(bmi), Some(children), Some(sex), Some(smoker), Some(region))
                if errors.is_empty() =>
            {
                Ok(Self {
                    // Bounds are checked above, both ranges fit in u32.
                    age: age as u32,
                    bmi,
                    children: children as u32,
                    sex,
                    smoker,
                    region,
                })
            }
            _ => Err(ValidationError::new(errors)),
        }
    }

    pub fn age(&self) -> u32 {
        self.age
    }

    pub fn bmi(&self) -> f64 {
        self.bmi
    }

    pub fn children(&self) -> u32 {
        self.children
    }

    pub fn sex(&self) -> Sex {
        self.sex
    }

    pub fn smoker(&self) -> Smoker {
        self.smoker
    }

    pub fn region(&self) -> Region {
        self.region
    }
}

fn check_int(
    field: &'static str,
    value: Option<&Value>,
    (min, max): (i64, i64),
    errors: &mut Vec<FieldError>,
) -> Option<i64> {
    let input = match value {
        None | Some(Value::Null) => {
            errors.push(missing(field));
            return None;
        }
        Some(v) => v,
    };

    let n = match input {
        Value::Number(num) => {
            if let Some(n) = num.as_i64() {
                n
            } else if num.is_u64() {
                // Larger than i64::MAX, so necessarily above the upper bound.
                i64::MAX
            } else {
                let f = num.as_f64().unwrap_or(f64::NAN);
                if f.fract() != 0.0 {
                    errors.push(FieldError::new(
                        field,
                        Constraint::IntFromFloat,
                        "Input should be a valid integer, got a number with a fractional part",
                        input.clone(),
                    ));
                    return None;
                }
                f as i64
            }
        }
        Value::String(text) => match text.trim().parse::<i64>() {
            Ok(n) => n,
            Err(_) => {
                errors.push(FieldError::new(
                    field,
                    Constraint::IntType,
                    "Input should be a valid integer, unable to parse string as an integer",
                    input.clone(),
                ));
                return None;
            }
        },
        _ => {
            errors.push(FieldError::new(
                field,
                Constraint::IntType,
                "Input should be a valid integer",
                input.clone(),
            ));
            return None;
        }
    };

    check_bounds(field, n, min, max, input, errors).then_some(n)
}

fn check_float(
    field: &'static str,
    value: Option<&Value>,
    (min, max): (f64, f64),
    errors: &mut Vec<FieldError>,
) -> Option<f64> {
    let input = match value {
        None | Some(Value::Null) => {
            errors.push(missing(field));
            return None;
        }
        Some(v) => v,
    };

    let parsed = match input {
        Value::String(text) => text.trim().parse::<f64>().ok(),
        other => other.as_f64(),
    };
    let Some(x) = parsed.filter(|x| x.is_finite()) else {
        errors.push(FieldError::new(
            field,
            Constraint::FloatType,
            "Input should be a valid number",
            input.clone(),
        ));
        return None;
    };

    check_bounds(field, x, min, max, input, errors).then_some(x)
}

fn check_bounds<T: PartialOrd + fmt::Display>(
    field: &'static str,
    n: T,
    min: T,
    max: T,
    input: &Value,
    errors: &mut Vec<FieldError>,
) -> bool {
    if n < min {
        errors.push(FieldError::new(
            field,
            Constraint::GreaterThanEqual,
            format!("Input should be greater than or equal to {min}"),
            input.clone(),
        ));
        false
    } else if n > max {
        errors.push(FieldError::new(
            field,
            Constraint::LessThanEqual,
            format!("Input should be less than or equal to {max}"),
            input.clone(),
        ));
        false
    } else {
        true
    }
}

fn check_literal<C: Category>(value: Option<&Value>, errors: &mut Vec<FieldError>) -> Option<C> {
    let input = match value {
        None | Some(Value::Null) => {
            errors.push(missing(C::FIELD));
            return None;
        }
        Some(v) => v,
    };

    let Some(s) = input.as_str() else {
        errors.push(FieldError::new(
            C::FIELD,
            Constraint::StringType,
            "Input should be a valid string",
            input.clone(),
        ));
        return None;
    };

    let parsed = C::parse(s);
    if parsed.is_none() {
        errors.push(FieldError::new(
            C::FIELD,
            Constraint::LiteralError,
            format!("Input should be {}", expected_literals(C::ALL)),
            input.clone(),
        ));
    }
    parsed
}

fn missing(field: &'static str) -> FieldError {
    FieldError::new(field, Constraint::Missing, "Field required", Value::Null)
}

/// `'a'`, `'a' or 'b'`, `'a', 'b' or 'c'`.
fn expected_literals<C: Category>(all: &[C]) -> String {
    let quoted: Vec<String> = all.iter().map(|c| format!("'{}'", c.as_str())).collect();
    match quoted.split_last() {
        Some((last, [])) => last.clone(),
        Some((last, rest)) => format!("{} or {}", rest.join(", "), last),
        None => String::new(),
    }
}

/// Value type carried by a feature column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    Float,
    Text,
}

/// A single cell of the ordered feature record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureValue {
    Int(i64),
    Float(f64),
    Text(&'static str),
}

impl FeatureValue {
    /// Numeric view of the cell; `None` for text.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FeatureValue::Int(n) => Some(n as f64),
            FeatureValue::Float(x) => Some(x),
            FeatureValue::Text(_) => None,
        }
    }
}

impl Serialize for FeatureValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            FeatureValue::Int(n) => serializer.serialize_i64(n),
            FeatureValue::Float(x) => serializer.serialize_f64(x),
            FeatureValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

/// Validated input plus its derived features: the row handed to the estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PersonRecord {
    input: PersonInput,
    age_group: AgeGroup,
    lifestyle_risk: LifestyleRisk,
    bmi_category: BmiCategory,
    age_bmi: f64,
    smoker_bmi: f64,
    smoker_age: f64,
}

impl PersonRecord {
    /// Column order the estimator was fit against.
    pub const COLUMNS: [&'static str; 12] = [
        "age",
        "bmi",
        "children",
        "sex",
        "smoker",
        "region",
        "age_group",
        "lifestyle_risk",
        "bmi_category",
        "age_bmi",
        "smoker_bmi",
        "smoker_age",
    ];

    /// Value type of each column, aligned with [`PersonRecord::COLUMNS`].
    pub const COLUMN_KINDS: [ColumnKind; 12] = [
        ColumnKind::Int,
        ColumnKind::Float,
        ColumnKind::Int,
        ColumnKind::Text,
        ColumnKind::Text,
        ColumnKind::Text,
        ColumnKind::Text,
        ColumnKind::Text,
        ColumnKind::Text,
        ColumnKind::Float,
        ColumnKind::Float,
        ColumnKind::Float,
    ];

    /// Derive every engineered feature from a validated input.
    pub fn from_input(input: PersonInput) -> Self {
        let smoker = input.smoker.is_smoker();
        Self {
            input,
            age_group: compute_age_group(input.age),
            lifestyle_risk: compute_lifestyle_risk(input.smoker, input.bmi),
            bmi_category: compute_bmi_category(input.bmi),
            age_bmi: f64::from(input.age) * input.bmi,
            smoker_bmi: if smoker { input.bmi } else { 0.0 },
            smoker_age: if smoker { f64::from(input.age) } else { 0.0 },
        }
    }

    pub fn input(&self) -> &PersonInput {
        &self.input
    }

    pub fn age_group(&self) -> AgeGroup {
        self.age_group
    }

    pub fn lifestyle_risk(&self) -> LifestyleRisk {
        self.lifestyle_risk
    }

    pub fn bmi_category(&self) -> BmiCategory {
        self.bmi_category
    }

    pub fn age_bmi(&self) -> f64 {
        self.age_bmi
    }

    pub fn smoker_bmi(&self) -> f64 {
        self.smoker_bmi
    }

    pub fn smoker_age(&self) -> f64 {
        self.smoker_age
    }

    /// Cell values, aligned with [`PersonRecord::COLUMNS`].
    pub fn values(&self) -> [FeatureValue; 12] {
        let i = &self.input;
        [
            FeatureValue::Int(i64::from(i.age)),
            FeatureValue::Float(i.bmi),
            FeatureValue::Int(i64::from(i.children)),
            FeatureValue::Text(i.sex.as_str()),
            FeatureValue::Text(i.smoker.as_str()),
            FeatureValue::Text(i.region.as_str()),
            FeatureValue::Text(self.age_group.as_str()),
            FeatureValue::Text(self.lifestyle_risk.as_str()),
            FeatureValue::Text(self.bmi_category.as_str()),
            FeatureValue::Float(self.age_bmi),
            FeatureValue::Float(self.smoker_bmi),
            FeatureValue::Float(self.smoker_age),
        ]
    }

    /// Value of a single column by name.
    pub fn get(&self, column: &str) -> Option<FeatureValue> {
        let idx = Self::COLUMNS.iter().position(|c| *c == column)?;
        Some(self.values()[idx])
    }
}

/// Serialises as a JSON object whose keys follow the column order.
impl Serialize for PersonRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Self::COLUMNS.len()))?;
        for (column, value) in Self::COLUMNS.iter().zip(self.values()) {
            map.serialize_entry(column, &value)?;
        }
        map.end()
    }
}

/// Validate a raw input and derive its feature record.
///
/// Pure function: identical input always yields an identical record.
pub fn derive(raw: &RawPersonInput) -> Result<PersonRecord, ValidationError> {
    PersonInput::validate(raw).map(PersonRecord::from_input)
}
