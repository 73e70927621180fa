use anyhow::{bail, Context};
use chrono::{Datelike, NaiveDate};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use crate::classify::Sex;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Participant {
    pub first_name: String,
    pub last_name: String,
    pub club: String,
    pub club_abbr: String,
    pub age: Option<u32>,
    pub rank: Option<String>,
    pub weight_kg: Option<f64>,
    pub sex: Sex,
    /// Roster file the row was read from.
    #[serde(default)]
    pub source: String,
    /// Line of the row in its roster file, the header is line 1.
    #[serde(default)]
    pub row: usize,
}

impl Participant {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim()).trim().to_string()
    }
    /// Name as written on the bracket, `NAME SURNAME (ABBR)`.
    pub fn display_name(&self) -> String {
        let name = self.full_name().to_uppercase();
        if self.club_abbr.is_empty() {
            name
        } else {
            format!("{name} ({})", self.club_abbr)
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Column {
    FirstName,
    LastName,
    BirthDate,
    Age,
    Weight,
    Rank,
    Sex,
    Club,
    ClubAbbr,
}

// Checked in this order, first hit wins, so "club name" is a club and "surname" is not a name.
const HEADER_KEYWORDS: &[(Column, &[&str])] = &[
    (Column::ClubAbbr, &["abrev", "abbrev", "sigla"]),
    (Column::LastName, &["apellido", "surname", "last name", "lastname"]),
    (Column::BirthDate, &["fecha", "nacimiento", "birth", "dob"]),
    (Column::Weight, &["peso", "weight"]),
    (Column::Rank, &["kup", "dan", "grado", "nivel", "rank", "belt", "cinturon", "cinturón"]),
    (Column::Sex, &["sexo", "género", "genero", "gender", "sex"]),
    (Column::Club, &["club", "academia", "delegación", "delegacion", "escuela", "team"]),
    (Column::Age, &["edad", "age"]),
    (Column::FirstName, &["nombre", "name"]),
];

fn classify_header(header: &str) -> Option<Column> {
    let header = header.trim().trim_start_matches('\u{feff}').to_lowercase();
    HEADER_KEYWORDS.iter()
        .find(|(_, words)| words.iter().any(|w| header.contains(w)))
        .map(|(col, _)| *col)
}

#[derive(Default, Debug)]
struct ColumnMap {
    first_name: Option<usize>,
    last_name: Option<usize>,
    birth_date: Option<usize>,
    age: Option<usize>,
    weight: Option<usize>,
    rank: Option<usize>,
    sex: Option<usize>,
    club: Option<usize>,
    club_abbr: Option<usize>,
}

impl ColumnMap {
    fn from_headers(headers: &csv::StringRecord) -> anyhow::Result<Self> {
        let mut map = ColumnMap::default();
        for (ix, header) in headers.iter().enumerate() {
            let Some(col) = classify_header(header) else {
                continue;
            };
            let slot = match col {
                Column::FirstName => &mut map.first_name,
                Column::LastName => &mut map.last_name,
                Column::BirthDate => &mut map.birth_date,
                Column::Age => &mut map.age,
                Column::Weight => &mut map.weight,
                Column::Rank => &mut map.rank,
                Column::Sex => &mut map.sex,
                Column::Club => &mut map.club,
                Column::ClubAbbr => &mut map.club_abbr,
            };
            slot.get_or_insert(ix);
        }
        debug!("Roster column mapping: {map:?}");
        let mut missing = Vec::new();
        if map.first_name.is_none() {
            missing.push("NOMBRES / NAME");
        }
        if map.weight.is_none() {
            missing.push("PESO / WEIGHT");
        }
        if map.sex.is_none() {
            missing.push("SEXO / GENDER");
        }
        if map.birth_date.is_none() && map.age.is_none() {
            missing.push("FECHA DE NACIMIENTO / BIRTH DATE or EDAD / AGE");
        }
        if !missing.is_empty() {
            bail!("Roster is missing required columns: {}", missing.join(", "));
        }
        Ok(map)
    }
}

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%d-%m-%Y"];

pub fn parse_birth_date(s: &str) -> Option<NaiveDate> {
    // spreadsheet exports append a midnight time
    let s = s.split_whitespace().next()?;
    DATE_FORMATS.iter().find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Whole years completed at `reference`.
pub fn age_at(birth: NaiveDate, reference: NaiveDate) -> Option<u32> {
    let mut years = reference.year() - birth.year();
    if (reference.month(), reference.day()) < (birth.month(), birth.day()) {
        years -= 1;
    }
    u32::try_from(years).ok()
}

pub fn parse_weight(s: &str) -> Option<f64> {
    let s = s.trim().to_lowercase();
    let s = s.trim_end_matches("kg").trim().replace(',', ".");
    let w = s.parse::<f64>().ok()?;
    (w.is_finite() && w > 0.0).then_some(w)
}

fn parse_age(s: &str) -> Option<u32> {
    let age = s.trim().replace(',', ".").parse::<f64>().ok()?;
    (age.is_finite() && age >= 0.0).then_some(age.trunc() as u32)
}

/// Upper-case initials of the first three words of the club name.
pub fn derive_abbreviation(club: &str) -> String {
    club.split_whitespace()
        .filter_map(|w| w.chars().find(|c| c.is_alphanumeric()))
        .take(3)
        .flat_map(|c| c.to_uppercase())
        .collect()
}

fn sniff_delimiter(data: &[u8]) -> u8 {
    let first_line = data.split(|b| *b == b'\n').next().unwrap_or_default();
    let count = |d: u8| first_line.iter().filter(|b| **b == d).count();
    if count(b';') > count(b',') { b';' } else { b',' }
}

/// Reads one roster file, `source` names it in the participants and in errors.
pub fn parse_roster(data: &[u8], source: &str, reference: NaiveDate) -> anyhow::Result<Vec<Participant>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(data))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data);
    let columns = ColumnMap::from_headers(reader.headers()?)
        .with_context(|| format!("Roster {source}"))?;
    let field = |record: &csv::StringRecord, ix: Option<usize>| -> String {
        ix.and_then(|ix| record.get(ix)).unwrap_or_default().trim().to_string()
    };
    let mut participants = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("Malformed row in roster {source}"))?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let row = record.position().map(|p| p.line() as usize).unwrap_or_default();
        let birth = field(&record, columns.birth_date);
        let age = parse_birth_date(&birth)
            .and_then(|b| age_at(b, reference))
            .or_else(|| parse_age(&field(&record, columns.age)));
        let club = field(&record, columns.club);
        let club_abbr = match field(&record, columns.club_abbr) {
            abbr if abbr.is_empty() => derive_abbreviation(&club),
            abbr => abbr.to_uppercase(),
        };
        let rank = Some(field(&record, columns.rank)).filter(|s| !s.is_empty());
        participants.push(Participant {
            first_name: field(&record, columns.first_name),
            last_name: field(&record, columns.last_name),
            club,
            club_abbr,
            age,
            rank,
            weight_kg: parse_weight(&field(&record, columns.weight)),
            sex: Sex::normalize(&field(&record, columns.sex)),
            source: source.to_string(),
            row,
        });
    }
    info!("Roster {source} parsed, {} participant rows", participants.len());
    Ok(participants)
}

#[cfg(test)]
mod test {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn headers_are_fuzzy_matched() {
        let csv = "NOMBRES,APELLIDOS,FECHA DE NACIMIENTO,PESO (kg),KUP/DAN,SEXO,ACADEMIA,ABREVIATURA\n\
                   Ana,Quispe,2016-03-10,\"22,5\",8vo KUP,F,Club Norte,CNT\n";
        let ps = parse_roster(csv.as_bytes(), "test", date(2024, 6, 1)).unwrap();
        assert_eq!(ps.len(), 1);
        let p = &ps[0];
        assert_eq!(p.first_name, "Ana");
        assert_eq!(p.last_name, "Quispe");
        assert_eq!(p.age, Some(8));
        assert_eq!(p.weight_kg, Some(22.5));
        assert_eq!(p.rank.as_deref(), Some("8vo KUP"));
        assert_eq!(p.sex, Sex::Female);
        assert_eq!(p.club, "Club Norte");
        assert_eq!(p.club_abbr, "CNT");
        assert_eq!(p.display_name(), "ANA QUISPE (CNT)");
    }

    #[test]
    fn english_headers_semicolon_and_derived_abbreviation() {
        let csv = "Name;Surname;Birth date;Weight;Rank;Gender;Club name\n\
                   Luis;Mamani;15/07/2010;41.2;1 DAN;male;tigres del sur academy\n\
                   ;;;;;;\n";
        let ps = parse_roster(csv.as_bytes(), "test", date(2024, 7, 14)).unwrap();
        assert_eq!(ps.len(), 1);
        assert_eq!(ps[0].last_name, "Mamani");
        assert_eq!(ps[0].age, Some(13));
        assert_eq!(ps[0].sex, Sex::Male);
        assert_eq!(ps[0].club_abbr, "TDS");
    }

    #[test]
    fn age_column_used_without_birth_date() {
        let csv = "nombre,edad,peso,sexo\nEva,12,40,F\nPia,x,40,F\n";
        let ps = parse_roster(csv.as_bytes(), "test", date(2024, 1, 1)).unwrap();
        assert_eq!(ps[0].age, Some(12));
        assert_eq!(ps[1].age, None);
        assert_eq!(ps[0].rank, None);
        assert_eq!(ps[0].club_abbr, "");
    }

    #[test]
    fn missing_columns_are_reported() {
        let err = parse_roster(b"nombre,sexo\nAna,F\n", "club_a", date(2024, 1, 1)).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("PESO"), "{msg}");
        assert!(msg.contains("BIRTH DATE"), "{msg}");
        assert!(msg.starts_with("Roster club_a"), "{msg}");
    }

    #[test]
    fn rows_are_file_lines() {
        let csv = "nombre,edad,peso,sexo\nEva,12,40,F\n\n,,,\nPia,x,40,F\n";
        let ps = parse_roster(csv.as_bytes(), "club_a", date(2024, 1, 1)).unwrap();
        let rows = ps.iter().map(|p| (p.first_name.as_str(), p.source.as_str(), p.row)).collect::<Vec<_>>();
        assert_eq!(rows, vec![("Eva", "club_a", 2), ("Pia", "club_a", 5)]);
    }

    #[test]
    fn birth_date_formats() {
        assert_eq!(parse_birth_date("2010-05-03"), Some(date(2010, 5, 3)));
        assert_eq!(parse_birth_date("03/05/2010"), Some(date(2010, 5, 3)));
        assert_eq!(parse_birth_date("12/31/2010"), Some(date(2010, 12, 31)));
        assert_eq!(parse_birth_date("03-05-2010"), Some(date(2010, 5, 3)));
        assert_eq!(parse_birth_date("2010-05-03 00:00:00"), Some(date(2010, 5, 3)));
        assert_eq!(parse_birth_date("ayer"), None);
        assert_eq!(parse_birth_date(""), None);
    }

    #[test]
    fn age_counts_completed_years() {
        let birth = date(2010, 5, 3);
        assert_eq!(age_at(birth, date(2024, 5, 2)), Some(13));
        assert_eq!(age_at(birth, date(2024, 5, 3)), Some(14));
        assert_eq!(age_at(birth, date(2009, 1, 1)), None);
    }

    #[test]
    fn weights() {
        assert_eq!(parse_weight("45"), Some(45.0));
        assert_eq!(parse_weight("45,5 kg"), Some(45.5));
        assert_eq!(parse_weight("45.5KG"), Some(45.5));
        assert_eq!(parse_weight(""), None);
        assert_eq!(parse_weight("abc"), None);
        assert_eq!(parse_weight("-3"), None);
    }
}
