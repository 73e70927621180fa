use std::fmt::{Display, Formatter};
use std::sync::LazyLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use crate::category::{CategoryTable, Grams, WeightBand};
use crate::roster::Participant;

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub enum Sex {
    Male,
    Female,
    #[default]
    Unknown,
}

impl Sex {
    pub fn normalize(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "M" | "MASCULINO" | "MALE" | "HOMBRE" | "VARON" | "VARÓN" => Sex::Male,
            "F" | "FEMENINO" | "FEMALE" | "MUJER" => Sex::Female,
            _ => Sex::Unknown,
        }
    }
}

impl Display for Sex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Sex::Male => f.write_str("MASCULINO"),
            Sex::Female => f.write_str("FEMENINO"),
            Sex::Unknown => f.write_str("DESCONOCIDO"),
        }
    }
}

/// Coarse skill grouping of kup/dan grades, lowest first.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum SkillTier {
    Festival,
    Novice,
    Advanced,
}

const BLACK_BELT_MARKERS: [&str; 3] = ["DAN", "NEGRO", "BLACK"];

static GRADE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

impl SkillTier {
    pub fn from_grade(grade: u32) -> Option<Self> {
        match grade {
            7..=10 => Some(SkillTier::Festival),
            3..=6 => Some(SkillTier::Novice),
            1..=2 => Some(SkillTier::Advanced),
            _ => None,
        }
    }
    /// Any black belt marker wins over the number, otherwise the first embedded
    /// kup grade decides. Missing or unmapped grades fall back to `Festival`.
    pub fn from_rank(rank: Option<&str>) -> Self {
        let Some(rank) = rank else {
            return SkillTier::Festival;
        };
        let rank = rank.trim().to_uppercase();
        if BLACK_BELT_MARKERS.iter().any(|m| rank.contains(m)) {
            return SkillTier::Advanced;
        }
        GRADE_RE.find(&rank)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .and_then(SkillTier::from_grade)
            .unwrap_or(SkillTier::Festival)
    }
}

impl Display for SkillTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SkillTier::Festival => f.write_str("Festival"),
            SkillTier::Novice => f.write_str("Noveles"),
            SkillTier::Advanced => f.write_str("Avanzados"),
        }
    }
}

/// Strategy resolving a weight against one ordered list of weight bands.
pub trait WeightPolicy: Send + Sync {
    fn resolve(&self, bands: &[WeightBand], weight: Grams) -> Option<WeightBand>;
}

/// Bounded bands sorted ascending, first threshold at or above the weight wins.
/// Heavier than every bounded band selects the unbounded band wherever it is declared.
pub struct CeilingPolicy;

impl WeightPolicy for CeilingPolicy {
    fn resolve(&self, bands: &[WeightBand], weight: Grams) -> Option<WeightBand> {
        let mut bounded = bands.iter().filter(|b| !b.is_unbounded()).copied().collect::<Vec<_>>();
        bounded.sort_by_key(|b| b.threshold());
        bounded.into_iter()
            .find(|b| weight <= b.threshold())
            .or_else(|| bands.iter().find(|b| b.is_unbounded()).copied())
    }
}

/// Bands scanned in declaration order. An unbounded band matches at or above its
/// threshold, a bounded band at or below it.
pub struct FirstMatchPolicy;

impl WeightPolicy for FirstMatchPolicy {
    fn resolve(&self, bands: &[WeightBand], weight: Grams) -> Option<WeightBand> {
        bands.iter()
            .find(|b| if b.is_unbounded() { weight >= b.threshold() } else { weight <= b.threshold() })
            .copied()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, Debug)]
#[serde(rename_all = "kebab-case")]
pub enum WeightPolicyKind {
    #[default]
    Ceiling,
    FirstMatch,
}

impl WeightPolicyKind {
    pub fn policy(self) -> &'static dyn WeightPolicy {
        match self {
            WeightPolicyKind::Ceiling => &CeilingPolicy,
            WeightPolicyKind::FirstMatch => &FirstMatchPolicy,
        }
    }
}

/// Grouping key of a bracket: two participants fight each other iff their categories are equal.
#[derive(Serialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Category {
    pub tier: SkillTier,
    pub age_band: String,
    pub sex: Sex,
    pub weight: WeightBand,
}

impl Category {
    pub fn label(&self) -> String {
        format!("{} {} {} {}", self.tier, self.age_band.replace('_', " "), self.sex, self.weight)
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RejectReason {
    MissingName,
    MissingAge,
    UnknownSex,
    NoAgeBand,
    InvalidWeight,
    NoWeightBand,
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MissingName => f.write_str("missing name"),
            RejectReason::MissingAge => f.write_str("missing or unparseable birth date / age"),
            RejectReason::UnknownSex => f.write_str("unknown sex"),
            RejectReason::NoAgeBand => f.write_str("no age band matches"),
            RejectReason::InvalidWeight => f.write_str("missing or non numeric weight"),
            RejectReason::NoWeightBand => f.write_str("no weight band matches"),
        }
    }
}

pub struct Classifier<'a> {
    table: &'a CategoryTable,
    policy: &'a dyn WeightPolicy,
}

impl<'a> Classifier<'a> {
    pub fn new(table: &'a CategoryTable, policy: &'a dyn WeightPolicy) -> Self {
        Self { table, policy }
    }

    pub fn classify(&self, participant: &Participant) -> Result<Category, RejectReason> {
        if participant.full_name().is_empty() {
            return Err(RejectReason::MissingName);
        }
        let age = participant.age.ok_or(RejectReason::MissingAge)?;
        let sex = participant.sex;
        if sex == Sex::Unknown {
            return Err(RejectReason::UnknownSex);
        }
        let band = self.table.age_band(age).ok_or(RejectReason::NoAgeBand)?;
        let weight = participant.weight_kg
            .and_then(Grams::from_kg)
            .ok_or(RejectReason::InvalidWeight)?;
        let bands = band.weights.for_sex(sex).ok_or(RejectReason::NoWeightBand)?;
        let weight = self.policy.resolve(bands, weight).ok_or(RejectReason::NoWeightBand)?;
        Ok(Category {
            tier: SkillTier::from_rank(participant.rank.as_deref()),
            age_band: band.label.clone(),
            sex,
            weight,
        })
    }
}
