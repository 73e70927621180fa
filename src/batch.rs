use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use chrono::NaiveDate;
use itertools::Itertools;
use log::{debug, error, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::Serialize;
use crate::assets::TemplateAssets;
use crate::assign::SlotAssignmentEngine;
use crate::category::CategoryTable;
use crate::classify::{Category, Classifier, RejectReason, WeightPolicyKind};
use crate::detect::SlotDetector;
use crate::export::{self, file_stem, ALL_CATEGORIES_FILE, SOLOS_FILE};
use crate::pages::DOCUMENT_FILE;
use crate::render::{encode_jpeg, BracketRenderer, RenderContext};
use crate::roster::Participant;
use crate::util::write_file;
use crate::AppConfig;

pub const REPORT_FILE: &str = "report.json";
pub const BRACKETS_DIR: &str = "brackets";
const REJECT_EXAMPLES: usize = 10;

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "kebab-case")]
pub enum BracketStatus {
    Rendered,
    /// Fewer than two participants, no bracket.
    Solo,
    MissingTemplate,
    Failed,
}

#[derive(Serialize, Clone, Debug)]
pub struct CategoryOutcome {
    pub label: String,
    pub participants: usize,
    pub csv: String,
    pub bracket: Option<String>,
    pub status: BracketStatus,
    /// Names on the bracket, top slot first.
    pub draw: Vec<String>,
}

#[derive(Serialize, Clone, Debug)]
pub struct RejectedRow {
    pub source: String,
    /// Line in the roster file, the header is line 1.
    pub row: usize,
    pub name: String,
    pub reason: RejectReason,
    pub message: String,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct RosterSource {
    pub file: String,
    pub rows: usize,
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct BatchReport {
    pub batch_id: String,
    /// Roster files in upload order.
    pub sources: Vec<RosterSource>,
    pub rows: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub reject_reasons: BTreeMap<String, usize>,
    pub reject_examples: Vec<RejectedRow>,
    pub categories: Vec<CategoryOutcome>,
    pub solos: usize,
    pub rendered: usize,
    pub warnings: Vec<String>,
    /// Paginated PDF of all brackets, two per page.
    pub document: Option<String>,
    pub pages: usize,
}

impl BatchReport {
    pub fn brackets(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().filter_map(|c| c.bracket.as_deref())
    }
}

struct GroupRender {
    bracket: Option<String>,
    status: BracketStatus,
    draw: Vec<String>,
    warnings: Vec<String>,
}

impl GroupRender {
    fn without_bracket(status: BracketStatus, warnings: Vec<String>) -> Self {
        Self { bracket: None, status, draw: Vec::new(), warnings }
    }
}

// Labels that share a file stem get a running number, so no output overwrites another.
fn unique_labels(labels: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    labels
        .map(|label| {
            let n = seen.entry(file_stem(&label)).or_default();
            *n += 1;
            if *n == 1 { label } else { format!("{label} ({n})") }
        })
        .collect()
}

fn roster_sources(participants: &[Participant]) -> Vec<RosterSource> {
    let mut sources: Vec<RosterSource> = Vec::new();
    for p in participants {
        match sources.iter_mut().find(|s| s.file == p.source) {
            Some(source) => source.rows += 1,
            None => sources.push(RosterSource { file: p.source.clone(), rows: 1 }),
        }
    }
    sources
}

/// Everything a batch needs, resolved once when the server starts.
pub struct Engine {
    pub table: CategoryTable,
    pub policy: WeightPolicyKind,
    pub assets: TemplateAssets,
    pub assigner: SlotAssignmentEngine,
    pub render: RenderContext,
    pub draw_seed: Option<u64>,
    pub pages: bool,
    pub reference_date: Option<NaiveDate>,
}

impl Engine {
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let table = match &cfg.categories_file {
            Some(path) => CategoryTable::load(path)?,
            None => {
                info!("No categories_file configured, using the built-in category table");
                CategoryTable::builtin()
            }
        };
        Ok(Self {
            table,
            policy: cfg.weight_policy,
            assets: TemplateAssets::new(&cfg.bracket_dir, SlotDetector::new(cfg.detect.clone())),
            assigner: SlotAssignmentEngine::new(cfg.assign.clone()),
            render: RenderContext::new(&cfg.render)?,
            draw_seed: cfg.draw_seed,
            pages: cfg.pages,
            reference_date: cfg.reference_date,
        })
    }

    pub fn reference_date(&self) -> NaiveDate {
        self.reference_date.unwrap_or_else(|| chrono::Local::now().date_naive())
    }

    /// Classifies `participants`, writes the exports and brackets under `out_dir`
    /// and returns the summary also saved as `report.json`.
    pub fn run(&self, batch_id: &str, participants: &[Participant], out_dir: &Path) -> anyhow::Result<BatchReport> {
        let mut report = BatchReport {
            batch_id: batch_id.to_string(),
            sources: roster_sources(participants),
            rows: participants.len(),
            ..Default::default()
        };
        let classifier = Classifier::new(&self.table, self.policy.policy());

        let mut groups: BTreeMap<Category, Vec<Participant>> = BTreeMap::new();
        for p in participants {
            match classifier.classify(p) {
                Ok(category) => groups.entry(category).or_default().push(p.clone()),
                Err(reason) => {
                    debug!("{} line {} ({}) rejected: {reason}", p.source, p.row, p.full_name());
                    *report.reject_reasons.entry(format!("{reason:?}")).or_default() += 1;
                    if report.reject_examples.len() < REJECT_EXAMPLES {
                        report.reject_examples.push(RejectedRow {
                            source: p.source.clone(),
                            row: p.row,
                            name: p.full_name(),
                            reason,
                            message: reason.to_string(),
                        });
                    }
                    report.rejected += 1;
                }
            }
        }
        report.accepted = participants.len() - report.rejected;

        let mut groups = groups.into_iter().collect::<Vec<_>>();
        if let Some(seed) = self.draw_seed {
            for (ix, (_, members)) in groups.iter_mut().enumerate() {
                members.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(ix as u64)));
            }
        }

        let labels = unique_labels(groups.iter().map(|(category, _)| category.label()));
        let csvs = groups.iter()
            .zip(&labels)
            .map(|((category, members), label)| export::write_category(out_dir, label, category, members))
            .collect::<anyhow::Result<Vec<_>>>()?;
        export::write_combined(out_dir, ALL_CATEGORIES_FILE, &groups)?;
        let solos = groups.iter()
            .filter(|(_, members)| members.len() < 2)
            .cloned()
            .collect::<Vec<_>>();
        export::write_combined(out_dir, SOLOS_FILE, &solos)?;
        report.solos = solos.iter().map(|(_, m)| m.len()).sum();

        // outcomes stay in group order, one per group
        let render_one = |((_, members), label): (&(Category, Vec<Participant>), &String)| {
            if members.len() < 2 {
                GroupRender::without_bracket(BracketStatus::Solo, Vec::new())
            } else {
                self.render_group(out_dir, label, members)
            }
        };
        let bracket_groups = groups.len() - solos.len();
        let rendered: Vec<GroupRender> = if bracket_groups > 1 {
            groups.par_iter().zip(&labels).map(render_one).collect()
        } else {
            groups.iter().zip(&labels).map(render_one).collect()
        };

        for ((((_, members), label), csv), outcome) in groups.iter().zip(labels).zip(csvs).zip(rendered) {
            report.warnings.extend(outcome.warnings);
            report.categories.push(CategoryOutcome {
                label,
                participants: members.len(),
                csv,
                bracket: outcome.bracket,
                status: outcome.status,
                draw: outcome.draw,
            });
        }
        report.rendered = report.categories.iter().filter(|c| c.status == BracketStatus::Rendered).count();

        if self.pages {
            let paths = report.brackets().map(|b| out_dir.join(b)).collect::<Vec<PathBuf>>();
            match crate::pages::write_document(out_dir, &paths) {
                Ok(0) => {}
                Ok(pages) => {
                    report.document = Some(DOCUMENT_FILE.to_string());
                    report.pages = pages;
                }
                Err(e) => {
                    warn!("Bracket document failed: {e:#}");
                    report.warnings.push(format!("bracket document: {e:#}"));
                }
            }
        }

        info!("Batch {batch_id}: {} rows, {} accepted, {} rejected, {} categories, {} brackets rendered, {} solos",
            report.rows, report.accepted, report.rejected, report.categories.len(), report.rendered, report.solos);
        if !report.reject_reasons.is_empty() {
            info!("Batch {batch_id} rejections: {}", report.reject_reasons.iter().map(|(k, v)| format!("{k}: {v}")).join(", "));
        }
        write_file(&out_dir.join(REPORT_FILE), &serde_json::to_vec_pretty(&report)?)?;
        Ok(report)
    }

    fn render_group(&self, out_dir: &Path, label: &str, members: &[Participant]) -> GroupRender {
        let template = match self.assets.get(members.len()) {
            Ok(Some(template)) => template,
            Ok(None) => {
                let warning = format!("{label}: no bracket template for {} participants", members.len());
                return GroupRender::without_bracket(BracketStatus::MissingTemplate, vec![warning]);
            }
            Err(e) => {
                error!("{label}: {e:#}");
                return GroupRender::without_bracket(BracketStatus::Failed, vec![format!("{label}: {e:#}")]);
            }
        };
        let mut warnings = Vec::new();
        let assignment = self.assigner.assign(members, &template.detection);
        if assignment.dropped > 0 {
            warnings.push(format!("{label}: template {} for {} shows room for only {}",
                template.path.to_string_lossy(), template.slots, assignment.bindings.len()));
        }
        if assignment.fallback_layout {
            warnings.push(format!("{label}: no slots found on template, names evenly spaced"));
        }
        let draw = assignment.bindings.iter().map(|b| b.participant.display_name()).collect();
        let image = BracketRenderer::new(&self.render).render(&template.image, &assignment.bindings, Some(label));
        let rel = format!("{BRACKETS_DIR}/{}_bracket.jpg", file_stem(label));
        let written = encode_jpeg(&image, self.render.config.jpeg_quality)
            .and_then(|data| write_file(&out_dir.join(&rel), &data));
        match written {
            Ok(()) => GroupRender { bracket: Some(rel), status: BracketStatus::Rendered, draw, warnings },
            Err(e) => {
                error!("{label}: cannot write bracket: {e:#}");
                warnings.push(format!("{label}: cannot write bracket: {e:#}"));
                GroupRender::without_bracket(BracketStatus::Failed, warnings)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::classify::{Sex, SkillTier};
    use crate::category::WeightBand;
    use crate::detect::test::{paint_template, slot_y};

    pub(crate) fn engine(template_dir: &Path) -> Engine {
        let cfg = AppConfig {
            bracket_dir: template_dir.to_path_buf(),
            reference_date: NaiveDate::from_ymd_opt(2024, 6, 1),
            ..Default::default()
        };
        Engine::from_config(&cfg).unwrap()
    }

    fn kid(name: &str, weight: f64) -> Participant {
        Participant {
            first_name: name.to_string(),
            last_name: "Flores".to_string(),
            club: "Club Andes".to_string(),
            club_abbr: "CA".to_string(),
            age: Some(10),
            rank: Some("8vo KUP".to_string()),
            weight_kg: Some(weight),
            sex: Sex::Female,
            source: "roster".to_string(),
            row: 0,
        }
    }

    fn numbered(mut roster: Vec<Participant>) -> Vec<Participant> {
        for (ix, p) in roster.iter_mut().enumerate() {
            p.row = ix + 2;
        }
        roster
    }

    #[test]
    fn four_in_one_category_use_the_four_template() {
        let templates = tempfile::tempdir().unwrap();
        paint_template(4, true).save(templates.path().join("4.png")).unwrap();
        let out = tempfile::tempdir().unwrap();
        // INFANTIL B bands -25, -30, -35: 30.0 sits on the -30 threshold
        let roster = vec![kid("Ana", 26.0), kid("Bea", 30.0), kid("Cleo", 28.5), kid("Dina", 29.9)];
        let report = engine(templates.path()).run("t1", &roster, out.path()).unwrap();

        assert_eq!(report.accepted, 4);
        assert_eq!(report.rejected, 0);
        assert_eq!(report.categories.len(), 1);
        let outcome = &report.categories[0];
        assert_eq!(outcome.label, "Festival INFANTIL B FEMENINO -30");
        assert_eq!(outcome.participants, 4);
        assert_eq!(outcome.status, BracketStatus::Rendered);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);

        let bracket = out.path().join(outcome.bracket.as_ref().unwrap());
        let img = image::open(&bracket).unwrap().to_rgb8();
        let template = paint_template(4, true);
        assert_eq!(img.dimensions(), template.dimensions());
        // every slot received a name above its line
        for slot in 0..4 {
            let y = slot_y(slot);
            let dark = (y - 30..y - 5)
                .flat_map(|yy| (150..250).map(move |xx| (xx, yy as u32)))
                .filter(|(xx, yy)| img.get_pixel(*xx, *yy).0[0] < 128)
                .count();
            assert!(dark > 10, "slot {slot} has no name ({dark})");
        }
        assert!(out.path().join("categories/Festival INFANTIL B FEMENINO -30.csv").is_file());
        assert!(out.path().join(ALL_CATEGORIES_FILE).is_file());
        assert!(out.path().join(REPORT_FILE).is_file());
        assert_eq!(outcome.draw, vec!["ANA FLORES (CA)", "BEA FLORES (CA)", "CLEO FLORES (CA)", "DINA FLORES (CA)"]);
        assert_eq!(report.document.as_deref(), Some(DOCUMENT_FILE));
        assert_eq!(report.pages, 1);
        assert!(out.path().join(DOCUMENT_FILE).is_file());
        assert_eq!(report.sources, vec![RosterSource { file: "roster".to_string(), rows: 4 }]);
    }

    #[test]
    fn boundary_weight_stays_in_lower_band() {
        let table = CategoryTable::builtin();
        let classifier = Classifier::new(&table, WeightPolicyKind::Ceiling.policy());
        let at = classifier.classify(&kid("Bea", 30.0)).unwrap();
        let over = classifier.classify(&kid("Eva", 30.1)).unwrap();
        assert_eq!(at.weight, WeightBand::at_most(30.0));
        assert_eq!(over.weight, WeightBand::at_most(35.0));
        assert_eq!(at.tier, SkillTier::Festival);
    }

    #[test]
    fn solos_rejects_and_missing_templates_do_not_abort() {
        let templates = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut nameless = kid("", 27.0);
        nameless.last_name.clear();
        let mut unknown = kid("Ivy", 27.0);
        unknown.sex = Sex::Unknown;
        let roster = numbered(vec![
            kid("Ana", 26.0), kid("Bea", 27.0),
            kid("Solo", 40.0),
            nameless, unknown,
            Participant { age: None, ..kid("Zoe", 27.0) },
        ]);
        let report = engine(templates.path()).run("t2", &roster, out.path()).unwrap();
        assert_eq!(report.rows, 6);
        assert_eq!(report.accepted, 3);
        assert_eq!(report.rejected, 3);
        assert_eq!(report.reject_reasons.get("MissingName"), Some(&1));
        assert_eq!(report.reject_reasons.get("UnknownSex"), Some(&1));
        assert_eq!(report.reject_reasons.get("MissingAge"), Some(&1));
        let rejected = report.reject_examples.iter().map(|r| (r.source.as_str(), r.row)).collect::<Vec<_>>();
        assert_eq!(rejected, vec![("roster", 5), ("roster", 6), ("roster", 7)]);
        assert_eq!(report.solos, 1);
        let statuses = report.categories.iter().map(|c| (c.label.as_str(), c.status)).collect::<Vec<_>>();
        assert_eq!(statuses, vec![
            ("Festival INFANTIL B FEMENINO -30", BracketStatus::MissingTemplate),
            ("Festival INFANTIL B FEMENINO +35", BracketStatus::Solo),
        ]);
        assert_eq!(report.rendered, 0);
        assert_eq!(report.warnings.len(), 1);
        let solos = std::fs::read_to_string(out.path().join(SOLOS_FILE)).unwrap();
        assert!(solos.contains("Festival INFANTIL B FEMENINO +35,Solo,"));
        assert!(out.path().join("categories/Festival INFANTIL B FEMENINO -30.csv").is_file());
    }

    #[test]
    fn draw_seed_shuffles_reproducibly() {
        let templates = tempfile::tempdir().unwrap();
        paint_template(6, true).save(templates.path().join("6.png")).unwrap();
        let roster = (0..6).map(|i| kid(&format!("K{i}"), 26.0)).collect::<Vec<_>>();
        let mut engine = engine(templates.path());
        engine.draw_seed = Some(11);
        engine.pages = false;
        let names = |members: &[Participant]| members.iter().map(|p| p.display_name()).collect::<Vec<_>>();
        let read = |dir: &Path| std::fs::read_to_string(dir.join("categories/Festival INFANTIL B FEMENINO -30.csv")).unwrap();

        let mut shuffled = roster.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(11));
        assert_ne!(names(&shuffled), names(&roster));

        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let first = engine.run("a", &roster, a.path()).unwrap();
        let second = engine.run("b", &roster, b.path()).unwrap();
        assert_eq!(read(a.path()), read(b.path()));
        let outcome = &first.categories[0];
        assert_eq!(outcome.status, BracketStatus::Rendered);
        // slots are bound top to bottom in drawn order
        assert_eq!(outcome.draw, names(&shuffled));
        assert_eq!(second.categories[0].draw, outcome.draw);
        let csv_names = read(a.path()).lines().skip(1)
            .map(|l| l.split(',').next().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(csv_names, shuffled.iter().map(|p| p.first_name.clone()).collect::<Vec<_>>());

        engine.draw_seed = None;
        let c = tempfile::tempdir().unwrap();
        let unseeded = engine.run("c", &roster, c.path()).unwrap();
        assert_eq!(unseeded.categories[0].draw, names(&roster));
    }

    #[test]
    fn equal_labels_do_not_overwrite_each_other() {
        let templates = tempfile::tempdir().unwrap();
        paint_template(2, true).save(templates.path().join("2.png")).unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut engine = engine(templates.path());
        engine.table = CategoryTable::from_yaml("INFANTIL_B:\n  EDAD: [9, 10]\n  PESOS: [\"-30\", \"+30\"]\n\
            INFANTIL B:\n  EDAD: [11, 12]\n  PESOS: [\"-30\", \"+30\"]\n").unwrap();
        let older = |name: &str| Participant { age: Some(11), ..kid(name, 26.0) };
        let roster = vec![kid("Ana", 26.0), kid("Bea", 26.0), older("Cleo"), older("Dina")];
        let report = engine.run("t3", &roster, out.path()).unwrap();

        let labels = report.categories.iter().map(|c| c.label.as_str()).collect::<Vec<_>>();
        assert_eq!(labels, vec!["Festival INFANTIL B FEMENINO -30", "Festival INFANTIL B FEMENINO -30 (2)"]);
        assert_eq!(report.rendered, 2);
        let brackets = report.brackets().collect::<Vec<_>>();
        assert_ne!(brackets[0], brackets[1]);
        assert_ne!(report.categories[0].csv, report.categories[1].csv);
        for c in &report.categories {
            assert!(out.path().join(&c.csv).is_file());
            assert_eq!(c.participants, 2);
        }
        let draws = report.categories.iter().map(|c| c.draw[0].as_str()).collect::<Vec<_>>();
        // INFANTIL B (11-12) sorts before INFANTIL_B (9-10)
        assert_eq!(draws, vec!["CLEO FLORES (CA)", "ANA FLORES (CA)"]);
        assert_eq!(report.pages, 1);
    }

    #[test]
    fn sources_keep_upload_order() {
        let mut a = kid("Ana", 26.0);
        a.source = "club_b".to_string();
        let mut b = kid("Bea", 26.0);
        b.source = "club_a".to_string();
        let sources = roster_sources(&[a.clone(), b, a]);
        assert_eq!(sources, vec![
            RosterSource { file: "club_b".to_string(), rows: 2 },
            RosterSource { file: "club_a".to_string(), rows: 1 },
        ]);
    }
}
