use log::warn;
use serde::{Deserialize, Serialize};
use crate::detect::{first_round, Detection, Point, Segment};
use crate::roster::Participant;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AssignConfig {
    /// Distance left of a line start where a missing marker is assumed.
    pub marker_offset: i32,
    /// Length of the horizontal line assumed right of a marker without one.
    pub virtual_line_reach: i32,
    /// X of the slots in the evenly spaced layout used for blank templates.
    pub fallback_x: i32,
    /// Lines starting this close to the leftmost line start are first round entries.
    pub first_round_gap: i32,
}

impl Default for AssignConfig {
    fn default() -> Self {
        Self { marker_offset: 10, virtual_line_reach: 400, fallback_x: 100, first_round_gap: 10 }
    }
}

/// Where one name goes: the marker it starts from and the line anchor its text runs towards.
#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct Slot {
    pub marker: Point,
    pub anchor: Point,
    pub virtual_line: bool,
    pub synthetic_marker: bool,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Binding<'a> {
    pub participant: &'a Participant,
    pub slot: Slot,
}

#[derive(Debug, Default)]
pub struct Assignment<'a> {
    /// In slot order, top to bottom.
    pub bindings: Vec<Binding<'a>>,
    /// Participants beyond the template capacity, not placed.
    pub dropped: usize,
    /// No marker and no line was detected, slots are evenly spaced.
    pub fallback_layout: bool,
}

pub struct SlotAssignmentEngine {
    config: AssignConfig,
}

impl SlotAssignmentEngine {
    pub fn new(config: AssignConfig) -> Self {
        Self { config }
    }

    fn virtual_slot(&self, marker: Point) -> Slot {
        Slot {
            marker,
            anchor: Point::new(marker.x + self.config.virtual_line_reach, marker.y),
            virtual_line: true,
            synthetic_marker: false,
        }
    }

    fn marker_for(&self, line: &Segment) -> Point {
        Point::new(line.start.x - self.config.marker_offset, line.mid().y)
    }

    /// Binds participants to template slots. Markers are taken in (y, x) order and
    /// each is paired greedily with the nearest unused line, so equal inputs always
    /// give equal bindings. Slots without a marker only come from first round lines.
    pub fn assign<'a>(&self, participants: &'a [Participant], detection: &Detection) -> Assignment<'a> {
        if detection.is_empty() {
            return self.fallback_layout(participants, detection.height);
        }
        let mut markers = detection.markers.clone();
        markers.sort_by_key(|p| (p.y, p.x));
        let mut pool = detection.lines.clone();
        pool.sort_by_key(|s| (s.mid().y, s.mid().x));
        let entries = first_round(&pool, self.config.first_round_gap);

        let count = participants.len().min(markers.len().max(entries.len()));
        let dropped = participants.len() - count;
        if dropped > 0 {
            warn!("Template offers {count} slots for {} participants, {dropped} not placed", participants.len());
        }
        if markers.is_empty() {
            markers = entries.iter().map(|l| self.marker_for(l)).collect();
        }

        let mut slots = Vec::with_capacity(count);
        for marker in markers.iter().take(count) {
            let nearest = pool.iter()
                .enumerate()
                .map(|(ix, line)| (ix, line.mid().dist2(marker)))
                .fold(None, |best: Option<(usize, i64)>, (ix, d)| match best {
                    Some((_, bd)) if bd <= d => best,
                    _ => Some((ix, d)),
                });
            let slot = match nearest {
                Some((ix, _)) => {
                    let line = pool.remove(ix);
                    Slot {
                        marker: *marker,
                        anchor: line.mid(),
                        virtual_line: false,
                        synthetic_marker: detection.markers.is_empty(),
                    }
                }
                None => self.virtual_slot(*marker),
            };
            slots.push(slot);
        }
        // fewer markers than slots, the unused entry lines get assumed markers
        let missing = count - slots.len();
        for line in entries.iter().filter(|l| pool.contains(l)).take(missing) {
            slots.push(Slot {
                marker: self.marker_for(line),
                anchor: line.mid(),
                virtual_line: false,
                synthetic_marker: true,
            });
        }
        slots.sort_by_key(|s| (s.marker.y, s.marker.x));

        Assignment {
            bindings: participants.iter()
                .zip(slots)
                .map(|(participant, slot)| Binding { participant, slot })
                .collect(),
            dropped,
            fallback_layout: false,
        }
    }

    fn fallback_layout<'a>(&self, participants: &'a [Participant], height: u32) -> Assignment<'a> {
        if !participants.is_empty() {
            warn!("Template shows no markers and no lines, using an evenly spaced layout");
        }
        let n = participants.len() as i64;
        let bindings = participants.iter()
            .enumerate()
            .map(|(i, participant)| {
                let y = (height as i64 * (i as i64 + 1) / (n + 1)) as i32;
                let mut slot = self.virtual_slot(Point::new(self.config.fallback_x, y));
                slot.synthetic_marker = true;
                Binding { participant, slot }
            })
            .collect();
        Assignment { bindings, dropped: 0, fallback_layout: true }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classify::Sex;
    use crate::detect::test::{paint_template, slot_y, LINE_X0, LINE_X1};
    use crate::detect::{DetectConfig, SlotDetector};

    fn people(n: usize) -> Vec<Participant> {
        (0..n).map(|i| Participant {
            first_name: format!("P{i}"),
            last_name: "Test".to_string(),
            club: String::new(),
            club_abbr: String::new(),
            age: Some(10),
            rank: None,
            weight_kg: Some(30.0),
            sex: Sex::Male,
            ..Default::default()
        }).collect()
    }

    fn line(x0: i32, x1: i32, y: i32) -> Segment {
        Segment::new(Point::new(x0, y), Point::new(x1, y))
    }

    fn detection(markers: Vec<Point>, lines: Vec<Segment>) -> Detection {
        Detection { width: 600, height: 400, markers, lines, ..Default::default() }
    }

    fn engine() -> SlotAssignmentEngine {
        SlotAssignmentEngine::new(AssignConfig::default())
    }

    #[test]
    fn three_markers_three_lines_is_bijection() {
        let ps = people(3);
        let det = detection(
            vec![Point::new(40, 250), Point::new(40, 50), Point::new(40, 150)],
            vec![line(60, 260, 150), line(60, 260, 52), line(60, 260, 249)],
        );
        let a = engine().assign(&ps, &det);
        assert_eq!(a.bindings.len(), 3);
        assert_eq!(a.dropped, 0);
        let markers = a.bindings.iter().map(|b| b.slot.marker.y).collect::<Vec<_>>();
        assert_eq!(markers, vec![50, 150, 250]);
        let mut anchors = a.bindings.iter().map(|b| b.slot.anchor).collect::<Vec<_>>();
        assert_eq!(anchors, vec![Point::new(160, 52), Point::new(160, 150), Point::new(160, 249)]);
        anchors.dedup();
        assert_eq!(anchors.len(), 3);
        assert!(a.bindings.iter().all(|b| !b.slot.virtual_line));
        let names = a.bindings.iter().map(|b| b.participant.first_name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["P0", "P1", "P2"]);
    }

    #[test]
    fn extra_marker_gets_virtual_line() {
        let ps = people(3);
        let det = detection(
            vec![Point::new(40, 50), Point::new(40, 150), Point::new(40, 250)],
            vec![line(60, 260, 50), line(60, 260, 250)],
        );
        let a = engine().assign(&ps, &det);
        assert_eq!(a.bindings.len(), 3);
        let virtuals = a.bindings.iter().filter(|b| b.slot.virtual_line).collect::<Vec<_>>();
        assert_eq!(virtuals.len(), 1);
        // greedy, no backtracking: the middle marker already took the lower line
        assert_eq!(virtuals[0].slot.marker, Point::new(40, 250));
        assert_eq!(virtuals[0].slot.anchor, Point::new(440, 250));
        assert_eq!(a.bindings[1].slot.anchor, Point::new(160, 250));
    }

    #[test]
    fn five_participants_four_slots_drops_one() {
        let ps = people(5);
        let det = detection(
            (0..4).map(|i| Point::new(40, 50 + i * 80)).collect(),
            (0..4).map(|i| line(60, 260, 50 + i * 80)).collect(),
        );
        let a = engine().assign(&ps, &det);
        assert_eq!(a.bindings.len(), 4);
        assert_eq!(a.dropped, 1);
        assert_eq!(a.bindings[3].participant.first_name, "P3");
    }

    #[test]
    fn markers_synthesized_from_lines() {
        let ps = people(2);
        let det = detection(vec![], vec![line(60, 260, 200), line(65, 265, 100)]);
        let a = engine().assign(&ps, &det);
        assert_eq!(a.bindings.len(), 2);
        assert_eq!(a.bindings[0].slot.marker, Point::new(55, 100));
        assert_eq!(a.bindings[0].slot.anchor, Point::new(165, 100));
        assert_eq!(a.bindings[1].slot.marker, Point::new(50, 200));
        assert!(a.bindings.iter().all(|b| b.slot.synthetic_marker && !b.slot.virtual_line));
    }

    #[test]
    fn lines_synthesized_from_markers() {
        let ps = people(2);
        let det = detection(vec![Point::new(30, 90), Point::new(30, 40)], vec![]);
        let a = engine().assign(&ps, &det);
        let anchors = a.bindings.iter().map(|b| b.slot.anchor).collect::<Vec<_>>();
        assert_eq!(anchors, vec![Point::new(430, 40), Point::new(430, 90)]);
        assert!(a.bindings.iter().all(|b| b.slot.virtual_line));
    }

    #[test]
    fn fewer_markers_than_participants_pads_from_lines() {
        let ps = people(3);
        let det = detection(
            vec![Point::new(40, 100)],
            vec![line(60, 260, 300), line(60, 260, 100), line(60, 260, 200)],
        );
        let a = engine().assign(&ps, &det);
        assert_eq!(a.bindings.len(), 3);
        let slots = a.bindings.iter().map(|b| (b.slot.marker, b.slot.synthetic_marker)).collect::<Vec<_>>();
        assert_eq!(slots, vec![
            (Point::new(40, 100), false),
            (Point::new(50, 200), true),
            (Point::new(50, 300), true),
        ]);
    }

    #[test]
    fn later_round_lines_never_get_assumed_markers() {
        let ps = people(3);
        // entry lines at 60 and 120, their joins at 90 (second round) and 150 (final)
        let det = detection(
            vec![Point::new(46, 60)],
            vec![line(60, 260, 60), line(60, 260, 120), line(260, 380, 90), line(380, 500, 150)],
        );
        let a = engine().assign(&ps, &det);
        assert_eq!(a.dropped, 1);
        let anchors = a.bindings.iter().map(|b| b.slot.anchor).collect::<Vec<_>>();
        assert_eq!(anchors, vec![Point::new(160, 60), Point::new(160, 120)]);
        assert!(a.bindings[1].slot.synthetic_marker);
    }

    #[test]
    fn dotless_template_fills_first_round_slots() {
        let template = image::DynamicImage::ImageRgb8(paint_template(4, false));
        let det = SlotDetector::new(DetectConfig::default()).detect(&template);
        assert!(det.fallback_markers);
        let ps = people(4);
        let a = engine().assign(&ps, &det);
        assert_eq!(a.bindings.len(), 4);
        assert_eq!(a.dropped, 0);
        for (slot, binding) in a.bindings.iter().enumerate() {
            assert_eq!(binding.participant.first_name, format!("P{slot}"));
            let anchor = binding.slot.anchor;
            assert!((anchor.y - slot_y(slot)).abs() <= 2, "slot {slot}: {anchor:?}");
            assert!((anchor.x - (LINE_X0 + LINE_X1) / 2).abs() <= 20, "slot {slot}: {anchor:?}");
            assert!(!binding.slot.virtual_line);
        }
    }

    #[test]
    fn nearest_line_ties_go_to_first() {
        let ps = people(1);
        let det = detection(vec![Point::new(100, 100)], vec![line(150, 250, 150), line(150, 250, 50)]);
        let a = engine().assign(&ps, &det);
        // both anchors at equal distance, the upper one comes first in the pool
        assert_eq!(a.bindings[0].slot.anchor, Point::new(200, 50));
    }

    #[test]
    fn blank_template_uses_even_layout() {
        let ps = people(3);
        let a = engine().assign(&ps, &detection(vec![], vec![]));
        assert!(a.fallback_layout);
        let ys = a.bindings.iter().map(|b| b.slot.marker.y).collect::<Vec<_>>();
        assert_eq!(ys, vec![100, 200, 300]);
        assert!(a.bindings.iter().all(|b| b.slot.marker.x == 100));
    }

    #[test]
    fn no_participants_no_bindings() {
        let det = detection(vec![Point::new(40, 50)], vec![line(60, 260, 50)]);
        let a = engine().assign(&[], &det);
        assert!(a.bindings.is_empty());
        assert_eq!(a.dropped, 0);
    }

    #[test]
    fn assignment_is_deterministic() {
        let ps = people(4);
        let det = detection(
            vec![Point::new(40, 60), Point::new(40, 120), Point::new(45, 180), Point::new(40, 240)],
            vec![line(60, 260, 60), line(60, 260, 120), line(260, 380, 90), line(60, 260, 180), line(60, 260, 240)],
        );
        let a = engine().assign(&ps, &det);
        let b = engine().assign(&ps, &det);
        assert_eq!(a.bindings, b.bindings);
    }
}
