use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use anyhow::{anyhow, bail, Context};
use log::info;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use crate::classify::Sex;

/// Weight threshold stored in grams so bands can be hashed and ordered.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Grams(pub u32);
impl Grams {
    pub fn from_kg(kg: f64) -> Option<Self> {
        if !kg.is_finite() || kg < 0.0 {
            return None;
        }
        Some(Self((kg * 1000.0).round() as u32))
    }
    pub fn kg(self) -> f64 {
        self.0 as f64 / 1000.0
    }
}
impl Display for Grams {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            let s = format!("{:.3}", self.kg());
            f.write_str(s.trim_end_matches('0'))
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum WeightLimit {
    /// "-T": at most T
    AtMost(Grams),
    /// "+T": more than T, unbounded above
    Above(Grams),
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct WeightBand {
    pub limit: WeightLimit,
}
impl WeightBand {
    pub fn at_most(kg: f64) -> Self {
        Self { limit: WeightLimit::AtMost(Grams::from_kg(kg).unwrap_or(Grams(0))) }
    }
    pub fn above(kg: f64) -> Self {
        Self { limit: WeightLimit::Above(Grams::from_kg(kg).unwrap_or(Grams(0))) }
    }
    pub fn threshold(&self) -> Grams {
        match self.limit {
            WeightLimit::AtMost(t) | WeightLimit::Above(t) => t,
        }
    }
    pub fn is_unbounded(&self) -> bool {
        matches!(self.limit, WeightLimit::Above(_))
    }
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let s = s.trim().trim_end_matches(|c: char| c.is_ascii_alphabetic()).trim();
        let (unbounded, num) = if let Some(num) = s.strip_prefix('+') {
            (true, num)
        } else if let Some(num) = s.strip_prefix('-') {
            (false, num)
        } else {
            bail!("Weight band '{s}' must start with '-' or '+'");
        };
        let kg = num.trim().replace(',', ".").parse::<f64>()
            .map_err(|e| anyhow!("Weight band '{s}' has invalid threshold: {e}"))?;
        let grams = Grams::from_kg(kg).ok_or_else(|| anyhow!("Weight band '{s}' threshold out of range"))?;
        Ok(Self {
            limit: if unbounded { WeightLimit::Above(grams) } else { WeightLimit::AtMost(grams) },
        })
    }
}
impl Display for WeightBand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.limit {
            WeightLimit::AtMost(t) => write!(f, "-{t}"),
            WeightLimit::Above(t) => write!(f, "+{t}"),
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub enum WeightLists {
    Shared(Vec<WeightBand>),
    BySex { male: Vec<WeightBand>, female: Vec<WeightBand> },
}
impl WeightLists {
    pub fn for_sex(&self, sex: Sex) -> Option<&[WeightBand]> {
        match self {
            WeightLists::Shared(bands) => Some(bands),
            WeightLists::BySex { male, female } => match sex {
                Sex::Male => Some(male),
                Sex::Female => Some(female),
                Sex::Unknown => None,
            },
        }
    }
}

/// One age division of the table: label, inclusive age range, weight lists.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct AgeBand {
    pub label: String,
    pub min_age: u32,
    pub max_age: u32,
    pub weights: WeightLists,
}
impl AgeBand {
    pub fn contains(&self, age: u32) -> bool {
        self.min_age <= age && age <= self.max_age
    }
}

/// Age divisions in declaration order. Order is the tie-break when bands overlap:
/// the first band containing an age wins.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct CategoryTable {
    pub bands: Vec<AgeBand>,
}

impl CategoryTable {
    pub fn age_band(&self, age: u32) -> Option<&AgeBand> {
        self.bands.iter().find(|band| band.contains(age))
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let table: CategoryTable = serde_json::from_str(content)?;
        table.validate()?;
        Ok(table)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let table: CategoryTable = serde_yaml::from_str(content)?;
        table.validate()?;
        Ok(table)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        info!("Loading category table from: {}", path.to_string_lossy());
        let content = fs::read_to_string(path)
            .with_context(|| format!("Cannot read category table {}", path.to_string_lossy()))?;
        let is_yaml = path.extension()
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        let table = if is_yaml { Self::from_yaml(&content) } else { Self::from_json(&content) };
        table.with_context(|| format!("Invalid category table {}", path.to_string_lossy()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bands.is_empty() {
            bail!("Category table is empty");
        }
        for band in &self.bands {
            if band.min_age > band.max_age {
                bail!("Age band {} has min age {} above max age {}", band.label, band.min_age, band.max_age);
            }
            match &band.weights {
                WeightLists::Shared(list) => validate_weight_list(&band.label, list)?,
                WeightLists::BySex { male, female } => {
                    validate_weight_list(&band.label, male)?;
                    validate_weight_list(&band.label, female)?;
                }
            }
        }
        Ok(())
    }

    /// Taekwondo divisions used when no table file is configured.
    pub fn builtin() -> Self {
        // every division is a ladder of "-T" bands topped by "+T" of the heaviest
        fn band(label: &str, min_age: u32, max_age: u32, limits: &[f64]) -> AgeBand {
            let mut weights = limits.iter().map(|kg| WeightBand::at_most(*kg)).collect::<Vec<_>>();
            weights.extend(limits.last().map(|kg| WeightBand::above(*kg)));
            AgeBand { label: label.to_string(), min_age, max_age, weights: WeightLists::Shared(weights) }
        }
        Self {
            bands: vec![
                band("PRE INFANTIL", 5, 6, &[24.0]),
                band("INFANTIL A", 7, 8, &[19.0, 23.0, 27.0, 31.0]),
                band("INFANTIL B", 9, 10, &[25.0, 30.0, 35.0]),
                band("INFANTIL C", 11, 12, &[30.0, 35.0, 40.0, 45.0]),
                band("CADETE", 13, 14, &[33.0, 37.0, 41.0, 45.0, 49.0, 53.0, 57.0, 61.0, 65.0]),
                band("JUVENIL", 15, 17, &[45.0, 48.0, 51.0, 55.0, 59.0, 63.0, 68.0, 73.0, 78.0]),
                band("MAYORES", 18, 50, &[53.0, 58.0, 63.0, 68.0, 74.0, 80.0, 87.0]),
            ],
        }
    }
}

fn validate_weight_list(label: &str, list: &[WeightBand]) -> anyhow::Result<()> {
    if list.is_empty() {
        bail!("Age band {label} has an empty weight list");
    }
    let unbounded = list.iter().filter(|b| b.is_unbounded()).collect::<Vec<_>>();
    if unbounded.len() > 1 {
        bail!("Age band {label} declares {} unbounded weight bands, at most one is allowed", unbounded.len());
    }
    if let Some(top) = unbounded.first() {
        let heaviest = list.iter().filter(|b| !b.is_unbounded()).map(|b| b.threshold()).max();
        if let Some(heaviest) = heaviest {
            if top.threshold() < heaviest {
                bail!("Age band {label}: unbounded band {top} is lighter than bounded band -{heaviest}");
            }
        }
    }
    Ok(())
}

// Raw shape of one table entry, Spanish keys as in the federation files, English aliases.
#[derive(Deserialize)]
struct RawBand {
    #[serde(alias = "EDAD", alias = "edad")]
    age: (u32, u32),
    #[serde(default, alias = "PESOS", alias = "pesos")]
    weights: Option<Vec<String>>,
    #[serde(default, alias = "SEXO", alias = "sexo", deserialize_with = "deserialize_sex_map")]
    sex: Option<Vec<(String, Vec<String>)>>,
}

fn parse_list(label: &str, list: &[String]) -> anyhow::Result<Vec<WeightBand>> {
    list.iter()
        .map(|w| WeightBand::parse(w).with_context(|| format!("Age band {label}")))
        .collect()
}

impl RawBand {
    fn into_band(self, label: String) -> anyhow::Result<AgeBand> {
        let weights = match (self.weights, self.sex) {
            (Some(list), _) => WeightLists::Shared(parse_list(&label, &list)?),
            (None, Some(by_sex)) => {
                let mut male = None;
                let mut female = None;
                for (key, list) in by_sex {
                    match Sex::normalize(&key) {
                        Sex::Male => male = Some(parse_list(&label, &list)?),
                        Sex::Female => female = Some(parse_list(&label, &list)?),
                        Sex::Unknown => bail!("Age band {label} has unknown sex key '{key}'"),
                    }
                }
                let (Some(male), Some(female)) = (male, female) else {
                    bail!("Age band {label} must list weights for both sexes");
                };
                WeightLists::BySex { male, female }
            }
            (None, None) => bail!("Age band {label} has no weight list"),
        };
        Ok(AgeBand { label, min_age: self.age.0, max_age: self.age.1, weights })
    }
}

// Sex-keyed lists arrive as a map, keep them as ordered pairs.
fn deserialize_sex_map<'de, D>(deserializer: D) -> Result<Option<Vec<(String, Vec<String>)>>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PairsVisitor;
    impl<'de> Visitor<'de> for PairsVisitor {
        type Value = Vec<(String, Vec<String>)>;
        fn expecting(&self, f: &mut Formatter) -> std::fmt::Result {
            f.write_str("a map of sex to weight list")
        }
        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut ret = Vec::new();
            while let Some((k, v)) = map.next_entry::<String, Vec<String>>()? {
                ret.push((k, v));
            }
            Ok(ret)
        }
    }
    deserializer.deserialize_map(PairsVisitor).map(Some)
}

impl<'de> Deserialize<'de> for CategoryTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TableVisitor;
        impl<'de> Visitor<'de> for TableVisitor {
            type Value = CategoryTable;
            fn expecting(&self, f: &mut Formatter) -> std::fmt::Result {
                f.write_str("a map of age band name to band definition")
            }
            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut bands = Vec::new();
                while let Some((label, raw)) = map.next_entry::<String, RawBand>()? {
                    let band = raw.into_band(label).map_err(de::Error::custom)?;
                    bands.push(band);
                }
                Ok(CategoryTable { bands })
            }
        }
        deserializer.deserialize_map(TableVisitor)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TABLE_JSON: &str = r#"{
        "INFANTIL_A": {"EDAD": [7, 8], "PESOS": ["-19", "-23", "+23"]},
        "JUVENIL": {"EDAD": [15, 17], "SEXO": {
            "MASCULINO": ["-45", "-48", "+48"],
            "FEMENINO": ["-42", "-44", "+44"]
        }},
        "CADETE": {"EDAD": [13, 14], "PESOS": ["+65", "-33", "-65"]}
    }"#;

    #[test]
    fn load_keeps_declaration_order() {
        let table = CategoryTable::from_json(TABLE_JSON).unwrap();
        let labels = table.bands.iter().map(|b| b.label.as_str()).collect::<Vec<_>>();
        assert_eq!(labels, vec!["INFANTIL_A", "JUVENIL", "CADETE"]);
        let WeightLists::BySex { male, female } = &table.bands[1].weights else {
            panic!("expected sex specific weights");
        };
        assert_eq!(male[1], WeightBand::at_most(48.0));
        assert_eq!(female[2], WeightBand::above(44.0));
    }

    #[test]
    fn load_yaml_with_english_keys() {
        let yaml = "SENIOR:\n  age: [18, 35]\n  weights: ['-58', '-68', '+68']\n";
        let table = CategoryTable::from_yaml(yaml).unwrap();
        assert_eq!(table.bands[0].min_age, 18);
        assert_eq!(table.bands[0].weights, WeightLists::Shared(vec![
            WeightBand::at_most(58.0), WeightBand::at_most(68.0), WeightBand::above(68.0),
        ]));
    }

    #[test]
    fn overlapping_bands_resolve_by_declaration_order() {
        let table = CategoryTable::from_json(r#"{
            "FIRST": {"EDAD": [10, 14], "PESOS": ["-40", "+40"]},
            "SECOND": {"EDAD": [12, 16], "PESOS": ["-50", "+50"]}
        }"#).unwrap();
        assert_eq!(table.age_band(12).unwrap().label, "FIRST");
        assert_eq!(table.age_band(14).unwrap().label, "FIRST");
        assert_eq!(table.age_band(15).unwrap().label, "SECOND");
        assert!(table.age_band(9).is_none());
        assert!(table.age_band(17).is_none());
    }

    #[test]
    fn builtin_bands_do_not_overlap() {
        let table = CategoryTable::builtin();
        table.validate().unwrap();
        for age in 0..=60 {
            let matching = table.bands.iter().filter(|b| b.contains(age)).count();
            assert!(matching <= 1, "age {age} matched {matching} bands");
        }
    }

    #[test]
    fn reject_two_unbounded_bands() {
        let err = CategoryTable::from_json(r#"{"X": {"EDAD": [1, 2], "PESOS": ["-20", "+20", "+30"]}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn reject_unbounded_lighter_than_bounded() {
        let err = CategoryTable::from_json(r#"{"X": {"EDAD": [1, 2], "PESOS": ["-20", "-40", "+30"]}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn reject_missing_weights_and_bad_tokens() {
        assert!(CategoryTable::from_json(r#"{"X": {"EDAD": [1, 2]}}"#).is_err());
        assert!(CategoryTable::from_json(r#"{"X": {"EDAD": [1, 2], "PESOS": ["45"]}}"#).is_err());
        assert!(CategoryTable::from_json(r#"{"X": {"EDAD": [3, 2], "PESOS": ["-45"]}}"#).is_err());
        assert!(CategoryTable::from_json("{}").is_err());
    }

    #[test]
    fn weight_band_display() {
        assert_eq!(WeightBand::parse("-45").unwrap().to_string(), "-45");
        assert_eq!(WeightBand::parse("+65KG").unwrap().to_string(), "+65");
        assert_eq!(WeightBand::parse("-27.5").unwrap().to_string(), "-27.5");
        assert_eq!(WeightBand::parse("-27,25").unwrap().to_string(), "-27.25");
    }
}
