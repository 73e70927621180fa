use std::path::Path;
use crate::classify::Category;
use crate::roster::Participant;
use crate::util::write_file;

pub const CATEGORIES_DIR: &str = "categories";
pub const ALL_CATEGORIES_FILE: &str = "ALL_CATEGORIES.csv";
pub const SOLOS_FILE: &str = "SOLOS.csv";

const HEADER: [&str; 9] = ["NOMBRES", "APELLIDOS", "EDAD", "PESO", "GRADO", "NIVEL", "SEXO", "ACADEMIA", "ABREVIATURA"];

/// File name safe form of a category label.
pub fn file_stem(label: &str) -> String {
    let stem = label.chars()
        .map(|c| if matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | '[' | ']') || c.is_control() { '_' } else { c })
        .collect::<String>();
    stem.trim().chars().take(200).collect()
}

fn record(category: &Category, p: &Participant) -> [String; 9] {
    [
        p.first_name.clone(),
        p.last_name.clone(),
        p.age.map(|a| a.to_string()).unwrap_or_default(),
        p.weight_kg.map(|w| w.to_string()).unwrap_or_default(),
        p.rank.clone().unwrap_or_default(),
        category.tier.to_string(),
        p.sex.to_string(),
        p.club.clone(),
        p.club_abbr.clone(),
    ]
}

fn to_csv<'a>(with_category: bool, rows: impl Iterator<Item = (&'a Category, &'a Participant)>) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if with_category {
        writer.write_record(std::iter::once("CATEGORIA").chain(HEADER))?;
    } else {
        writer.write_record(HEADER)?;
    }
    for (category, p) in rows {
        let fields = record(category, p);
        if with_category {
            writer.write_record(std::iter::once(category.label()).chain(fields))?;
        } else {
            writer.write_record(&fields)?;
        }
    }
    writer.into_inner().map_err(|e| anyhow::anyhow!("CSV buffer error: {e}"))
}

/// Writes `categories/<label>.csv` and returns its path relative to `out_dir`.
pub fn write_category(out_dir: &Path, label: &str, category: &Category, participants: &[Participant]) -> anyhow::Result<String> {
    let rel = format!("{CATEGORIES_DIR}/{}.csv", file_stem(label));
    let data = to_csv(false, participants.iter().map(|p| (category, p)))?;
    write_file(&out_dir.join(&rel), &data)?;
    Ok(rel)
}

/// One sheet for all groups, the category in the first column.
pub fn write_combined(out_dir: &Path, file: &str, groups: &[(Category, Vec<Participant>)]) -> anyhow::Result<()> {
    let rows = groups.iter().flat_map(|(c, ps)| ps.iter().map(move |p| (c, p)));
    write_file(&out_dir.join(file), &to_csv(true, rows)?)
}
