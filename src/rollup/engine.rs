//! Event dispatch and accumulation rules.
//!
//! [`Aggregator::apply`] turns one raw event into zero or more keyed updates
//! on the shared [`AccumulatorTable`]. Which metrics an event produces, the
//! key layout each metric uses, and whether it counts occurrences or sums
//! seconds is decided here and nowhere else.

use std::sync::Arc;

use tracing::warn;

use super::aggregate::{CtaBucket, Update};
use super::buffer::{AccumulatorTable, EntrySeed};
use super::config::CtaRouting;
use super::event::RawEvent;
use super::key::{day_bucket, AggregationKey, DimensionOrder, EntryId};

/// Start and click timings above this many seconds are not recorded.
pub const QUICK_INTERACTION_SECS: f64 = 60.0;

/// Metric name of the per-day click heatmap.
pub const HEATMAP_METRIC: &str = "heatmap";

/// Metric name of the per-day call-to-action split.
pub const CTA_METRIC: &str = "ctaClick";

/// Event names produced by this engine. Raw events already carrying one of
/// these names are replays and are never aggregated again.
const SYNTHESIZED_EVENTS: &[&str] = &[
    "gameStarted",
    "gameStartTime",
    "gameRestarted",
    "firstClick",
    "firstClickTime",
    "gameFinished",
    "endGameTime",
    "gameWon",
];

/// Updates produced by a single [`Aggregator::apply`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Updates written to the table.
    pub updates: u32,
    /// Updates refused because the key already holds another value kind.
    pub rejected: u32,
}

/// Applies raw events to the shared accumulator table.
pub struct Aggregator {
    table: Arc<AccumulatorTable>,
    cta_routing: CtaRouting,
}

impl Aggregator {
    pub fn new(table: Arc<AccumulatorTable>, cta_routing: CtaRouting) -> Self {
        Self { table, cta_routing }
    }

    pub fn table(&self) -> &Arc<AccumulatorTable> {
        &self.table
    }

    /// Aggregates one event for an already resolved game and customer.
    pub fn apply(&self, event: &RawEvent, game: &str, customer: &str) -> ApplyOutcome {
        let mut ctx = Emission {
            table: self.table.as_ref(),
            event,
            day: day_bucket(&event.timestamp),
            game,
            customer,
            outcome: ApplyOutcome::default(),
        };

        match event.event.as_str() {
            "platform" => {}
            "click" => ctx.click(),
            "cta" => {
                if self.cta_routing == CtaRouting::Merged {
                    ctx.cta();
                }
            }
            "ctaClick" => ctx.cta(),
            "end" => {
                let outcome = if event.value == 0.0 {
                    "gameWon"
                } else if event.value == 1.0 {
                    "gameLoss"
                } else {
                    "gameUnknownOutcome"
                };
                ctx.emit(DimensionOrder::NetworkVersion, false, Some(outcome));
                ctx.emit(DimensionOrder::NetworkVersion, false, Some("gameFinished"));
            }
            "start" => {
                ctx.emit(DimensionOrder::NetworkVersion, false, Some("gameStarted"));
                if event.time <= QUICK_INTERACTION_SECS {
                    ctx.emit(DimensionOrder::VersionNetwork, false, Some("gameStartedTime"));
                }
            }
            "restart" => ctx.emit(DimensionOrder::VersionNetwork, false, Some("gameRestarted")),
            "time" => ctx.emit(DimensionOrder::VersionNetwork, false, Some("totalTime")),
            "impression" => ctx.emit(DimensionOrder::VersionNetwork, false, Some("impression")),
            name if SYNTHESIZED_EVENTS.contains(&name) => {}
            "gameLose" => ctx.emit(DimensionOrder::VersionNetwork, true, None),
            _ => ctx.emit(DimensionOrder::VersionNetwork, false, None),
        }

        ctx.outcome
    }
}

/// Per-event state shared by the emit helpers.
struct Emission<'a> {
    table: &'a AccumulatorTable,
    event: &'a RawEvent,
    day: String,
    game: &'a str,
    customer: &'a str,
    outcome: ApplyOutcome,
}

impl Emission<'_> {
    /// Emits a scalar metric.
    ///
    /// `name` overrides the raw event name; an empty override falls back to
    /// it. Re-derived metrics sum the event's value field, time metrics
    /// (other than `totalTime`) sum elapsed seconds, everything else counts.
    fn emit(&mut self, order: DimensionOrder, rederive: bool, name: Option<&str>) {
        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ => self.event.event.as_str(),
        };

        let update = if rederive {
            Update::AddTime(whole_seconds(self.event.value))
        } else if name.contains("Time") && name != "totalTime" {
            Update::AddTime(whole_seconds(self.event.time))
        } else {
            Update::Count
        };

        self.record(order, name, update);
    }

    fn click(&mut self) {
        if self.event.value == 0.0 {
            self.emit(DimensionOrder::VersionNetwork, false, Some("firstClick"));
            self.emit(DimensionOrder::VersionNetwork, false, Some("firstClickTime"));
        }

        let Some(payload) = self.event.heatmap else {
            return;
        };
        if self.event.time > QUICK_INTERACTION_SECS {
            return;
        }

        let update = Update::Heat {
            orientation: payload.orientation(),
            second: self.event.time.floor() as i32,
            cell: payload.cell(),
        };
        self.record(DimensionOrder::VersionOsNetwork, HEATMAP_METRIC, update);
    }

    fn cta(&mut self) {
        let is_cta = self.event.event == "cta";
        let bucket = if !is_cta {
            CtaBucket::Unknown
        } else if self.event.value == 0.0 {
            CtaBucket::User
        } else if self.event.value == 1.0 {
            CtaBucket::Auto
        } else {
            CtaBucket::Unknown
        };
        self.record(DimensionOrder::VersionOsNetwork, CTA_METRIC, Update::Cta(bucket));

        if is_cta && self.event.time <= QUICK_INTERACTION_SECS {
            self.emit(DimensionOrder::VersionNetwork, false, Some("ctaTime"));
        }
    }

    fn record(&mut self, order: DimensionOrder, name: &str, update: Update) {
        let key = AggregationKey::new(order, self.event, &self.day, name);
        let seed = || EntrySeed {
            id: EntryId::new(self.event, &self.day, name),
            game: self.game.to_string(),
            customer: self.customer.to_string(),
        };

        match self.table.accumulate(key, seed, update) {
            Ok(()) => self.outcome.updates += 1,
            Err(e) => {
                self.outcome.rejected += 1;
                warn!(error = %e, version = %self.event.version, "accumulator update rejected");
            }
        }
    }
}

fn whole_seconds(secs: f64) -> i64 {
    secs.floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::aggregate::{AccumulatorValue, CtaSplit};
    use crate::rollup::buffer::AccumulatorEntry;
    use crate::rollup::event::{HeatmapPayload, Orientation};
    use chrono::{DateTime, TimeZone, Utc};

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 5, 14, 9, 30, 0)
            .single()
            .expect("valid date")
    }

    fn ev(name: &str) -> RawEvent {
        RawEvent::new("v1", "unity", name, ts()).with_os("android")
    }

    fn aggregator() -> Aggregator {
        Aggregator::new(Arc::new(AccumulatorTable::new()), CtaRouting::Observed)
    }

    fn merged() -> Aggregator {
        Aggregator::new(Arc::new(AccumulatorTable::new()), CtaRouting::Merged)
    }

    fn entry(agg: &Aggregator, name: &str) -> Option<AccumulatorEntry> {
        agg.table()
            .snapshot()
            .into_iter()
            .find(|e| e.id.event == name)
    }

    fn scalar(agg: &Aggregator, name: &str) -> Option<i64> {
        entry(agg, name).and_then(|e| e.value.as_scalar())
    }

    fn names(agg: &Aggregator) -> Vec<String> {
        let mut names: Vec<String> = agg
            .table()
            .snapshot()
            .into_iter()
            .map(|e| e.id.event)
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_platform_is_noop() {
        let agg = aggregator();
        let out = agg.apply(&ev("platform"), "g1", "c1");
        assert_eq!(out, ApplyOutcome::default());
        assert!(agg.table().is_empty());
    }

    #[test]
    fn test_synthesized_names_are_not_reaggregated() {
        let agg = aggregator();
        for name in SYNTHESIZED_EVENTS {
            agg.apply(&ev(name).with_time(10.0), "g1", "c1");
        }
        assert!(agg.table().is_empty());
    }

    #[test]
    fn test_end_emits_outcome_and_finished() {
        let agg = aggregator();
        agg.apply(&ev("end").with_value(0.0), "g1", "c1");
        agg.apply(&ev("end").with_value(1.0), "g1", "c1");
        agg.apply(&ev("end").with_value(1.0), "g1", "c1");
        let out = agg.apply(&ev("end").with_value(7.0), "g1", "c1");

        assert_eq!(out.updates, 2);
        assert_eq!(scalar(&agg, "gameWon"), Some(1));
        assert_eq!(scalar(&agg, "gameLoss"), Some(2));
        assert_eq!(scalar(&agg, "gameUnknownOutcome"), Some(1));
        assert_eq!(scalar(&agg, "gameFinished"), Some(4));
    }

    #[test]
    fn test_end_uses_network_first_key() {
        let agg = aggregator();
        agg.apply(&ev("end"), "g1", "c1");
        let day = day_bucket(&ts());
        let key = AggregationKey::new(DimensionOrder::NetworkVersion, &ev("end"), &day, "gameFinished");
        assert!(key.as_str().starts_with("unity::v1::android::"));
        assert!(agg.table().get(&key).is_some());
    }

    #[test]
    fn test_start_emits_started_and_time_sum() {
        let agg = aggregator();
        agg.apply(&ev("start").with_time(12.7), "g1", "c1");
        agg.apply(&ev("start").with_time(60.0), "g1", "c1");
        agg.apply(&ev("start").with_time(61.0), "g1", "c1");

        assert_eq!(scalar(&agg, "gameStarted"), Some(3));
        assert_eq!(scalar(&agg, "gameStartedTime"), Some(72));
        let started_time = entry(&agg, "gameStartedTime").expect("entry");
        assert!(matches!(started_time.value, AccumulatorValue::TimeSum(_)));
    }

    #[test]
    fn test_started_time_counts_one_emission_per_quick_start() {
        let agg = aggregator();
        let mut emitted = 0;
        for (i, name) in ["start", "impression", "start", "restart", "start"]
            .iter()
            .enumerate()
        {
            let out = agg.apply(&ev(name).with_time(1.0), "g1", "c1");
            if *name == "start" {
                assert_eq!(out.updates, 2, "event {i}");
                emitted += 1;
            }
        }
        assert_eq!(scalar(&agg, "gameStartedTime"), Some(emitted));
    }

    #[test]
    fn test_simple_renames() {
        let agg = aggregator();
        agg.apply(&ev("restart"), "g1", "c1");
        agg.apply(&ev("impression"), "g1", "c1");
        agg.apply(&ev("impression"), "g1", "c1");
        agg.apply(&ev("time").with_time(300.0), "g1", "c1");

        assert_eq!(scalar(&agg, "gameRestarted"), Some(1));
        assert_eq!(scalar(&agg, "impression"), Some(2));
        // totalTime is counted, not summed.
        assert_eq!(scalar(&agg, "totalTime"), Some(1));
        assert!(matches!(
            entry(&agg, "totalTime").expect("entry").value,
            AccumulatorValue::Counter(1)
        ));
    }

    #[test]
    fn test_game_lose_rederives_from_value() {
        let agg = aggregator();
        agg.apply(&ev("gameLose").with_value(42.9).with_time(5.0), "g1", "c1");
        agg.apply(&ev("gameLose").with_value(8.0).with_time(50.0), "g1", "c1");

        let lose = entry(&agg, "gameLose").expect("entry");
        assert_eq!(lose.value, AccumulatorValue::TimeSum(50));
    }

    #[test]
    fn test_unknown_names_pass_through() {
        let agg = aggregator();
        agg.apply(&ev("levelUp"), "g1", "c1");
        agg.apply(&ev("levelUp"), "g1", "c1");
        agg.apply(&ev("loadTime").with_time(3.9), "g1", "c1");
        agg.apply(&ev("loadTime").with_time(2.0), "g1", "c1");

        assert_eq!(scalar(&agg, "levelUp"), Some(2));
        assert_eq!(scalar(&agg, "loadTime"), Some(5));
    }

    #[test]
    fn test_click_first_click() {
        let agg = aggregator();
        agg.apply(&ev("click").with_value(0.0).with_time(4.0), "g1", "c1");
        agg.apply(&ev("click").with_value(3.0).with_time(9.0), "g1", "c1");

        assert_eq!(scalar(&agg, "firstClick"), Some(1));
        assert_eq!(scalar(&agg, "firstClickTime"), Some(4));
        assert_eq!(names(&agg), vec!["firstClick", "firstClickTime"]);
    }

    #[test]
    fn test_click_heatmap_accumulates() {
        let agg = aggregator();
        let payload = HeatmapPayload::new(3, 2, 10, 20);
        for _ in 0..3 {
            agg.apply(
                &ev("click").with_value(5.0).with_time(7.4).with_heatmap(payload),
                "g1",
                "c1",
            );
        }
        agg.apply(
            &ev("click")
                .with_value(5.0)
                .with_time(7.0)
                .with_heatmap(HeatmapPayload::new(-1, 2, 10, 20)),
            "g1",
            "c1",
        );

        let heatmap = entry(&agg, HEATMAP_METRIC).expect("heatmap entry");
        let grid = heatmap.value.as_heatmap().expect("grid");
        assert_eq!(grid.count(Orientation::Portrait, 7, payload.cell()), 3);
        assert_eq!(grid.count(Orientation::Landscape, 7, 20), 1);
        assert_eq!(grid.total(), 4);
        assert_eq!(heatmap.id.timespan_minutes, 1440);
    }

    #[test]
    fn test_click_heatmap_ignored_after_quick_window() {
        let agg = aggregator();
        agg.apply(
            &ev("click")
                .with_value(2.0)
                .with_time(61.0)
                .with_heatmap(HeatmapPayload::new(1, 1, 4, 4)),
            "g1",
            "c1",
        );
        assert!(agg.table().is_empty());
    }

    #[test]
    fn test_heatmap_key_uses_version_os_network() {
        let agg = aggregator();
        let event = ev("click")
            .with_value(2.0)
            .with_time(1.0)
            .with_heatmap(HeatmapPayload::new(1, 1, 4, 4));
        agg.apply(&event, "g1", "c1");

        let day = day_bucket(&ts());
        let key = AggregationKey::new(DimensionOrder::VersionOsNetwork, &event, &day, HEATMAP_METRIC);
        assert_eq!(
            key.as_str(),
            "v1::android::unity::2023-05-14T00:00:00.000+00:00::heatmap"
        );
        assert!(agg.table().get(&key).is_some());
    }

    #[test]
    fn test_cta_is_noop_under_observed_routing() {
        let agg = aggregator();
        agg.apply(&ev("cta").with_value(0.0), "g1", "c1");
        assert!(agg.table().is_empty());
    }

    #[test]
    fn test_cta_click_counts_unknown() {
        let agg = aggregator();
        agg.apply(&ev("ctaClick").with_value(0.0).with_time(3.0), "g1", "c1");
        agg.apply(&ev("ctaClick").with_value(1.0), "g1", "c1");

        let split = entry(&agg, CTA_METRIC).expect("cta entry");
        assert_eq!(
            split.value.as_cta_split(),
            Some(&CtaSplit {
                user: 0,
                auto: 0,
                unknown: 2
            })
        );
        // ctaTime is only emitted for raw `cta` events.
        assert!(entry(&agg, "ctaTime").is_none());
    }

    #[test]
    fn test_merged_cta_split() {
        let agg = merged();
        agg.apply(&ev("cta").with_value(0.0).with_time(70.0), "g1", "c1");
        agg.apply(&ev("cta").with_value(1.0).with_time(70.0), "g1", "c1");
        agg.apply(&ev("cta").with_value(2.0).with_time(70.0), "g1", "c1");

        let split = entry(&agg, CTA_METRIC).expect("cta entry");
        assert_eq!(
            split.value.as_cta_split(),
            Some(&CtaSplit {
                user: 1,
                auto: 1,
                unknown: 1
            })
        );
        assert!(entry(&agg, "ctaTime").is_none());
    }

    #[test]
    fn test_merged_cta_emits_time_with_game_and_customer() {
        let agg = merged();
        agg.apply(&ev("cta").with_value(0.0).with_time(8.5), "g1", "c1");

        let cta_time = entry(&agg, "ctaTime").expect("ctaTime entry");
        assert_eq!(cta_time.value, AccumulatorValue::TimeSum(8));
        assert_eq!(cta_time.game, "g1");
        assert_eq!(cta_time.customer, "c1");
    }

    #[test]
    fn test_kind_mismatch_is_rejected_not_fatal() {
        let agg = aggregator();
        agg.apply(
            &ev("click")
                .with_value(2.0)
                .with_time(1.0)
                .with_heatmap(HeatmapPayload::new(1, 1, 4, 4)),
            "g1",
            "c1",
        );

        // A raw `heatmap` event counts verbatim into the grid's accumulator.
        let out = agg.apply(&ev(HEATMAP_METRIC), "g1", "c1");

        assert_eq!(out.updates, 0);
        assert_eq!(out.rejected, 1);
        assert_eq!(agg.table().len(), 1);
        assert!(entry(&agg, HEATMAP_METRIC)
            .expect("entry")
            .value
            .as_heatmap()
            .is_some());
    }

    #[test]
    fn test_same_metric_from_different_layouts_shares_entry() {
        let agg = aggregator();
        agg.apply(&ev("end").with_value(1.0), "g1", "c1");
        agg.apply(&ev("gameLoss"), "g1", "c1");

        let losses: Vec<_> = agg
            .table()
            .snapshot()
            .into_iter()
            .filter(|e| e.id.event == "gameLoss")
            .collect();
        assert_eq!(losses.len(), 1);
        assert_eq!(losses[0].value, AccumulatorValue::Counter(2));
    }

    #[test]
    fn test_accumulation_is_order_independent() {
        let events = vec![
            ev("start").with_time(10.0),
            ev("end").with_value(1.0),
            ev("click")
                .with_value(0.0)
                .with_time(3.0)
                .with_heatmap(HeatmapPayload::new(2, 2, 5, 5)),
            ev("impression"),
            ev("gameLose").with_value(12.0),
            ev("ctaClick"),
            ev("start").with_time(30.0).with_os("ios"),
        ];

        let forward = aggregator();
        for e in &events {
            forward.apply(e, "g1", "c1");
        }
        let backward = aggregator();
        for e in events.iter().rev() {
            backward.apply(e, "g1", "c1");
        }

        let mut a = forward.table().snapshot();
        let mut b = backward.table().snapshot();
        a.sort_by(|x, y| format!("{:?}", x.id).cmp(&format!("{:?}", y.id)));
        b.sort_by(|x, y| format!("{:?}", x.id).cmp(&format!("{:?}", y.id)));
        assert_eq!(a, b);
    }

    #[test]
    fn test_end_to_end_scenario() {
        let agg = aggregator();
        agg.apply(&ev("start").with_time(10.0), "g1", "c1");
        agg.apply(&ev("start").with_time(10.0), "g1", "c1");
        agg.apply(&ev("click").with_value(0.0).with_time(5.0), "g1", "c1");

        assert_eq!(scalar(&agg, "gameStarted"), Some(2));
        assert_eq!(scalar(&agg, "gameStartedTime"), Some(20));
        assert_eq!(scalar(&agg, "firstClick"), Some(1));
        assert_eq!(scalar(&agg, "firstClickTime"), Some(5));
        assert_eq!(
            names(&agg),
            vec!["firstClick", "firstClickTime", "gameStarted", "gameStartedTime"]
        );
        for e in agg.table().snapshot() {
            assert_eq!(e.game, "g1");
            assert_eq!(e.customer, "c1");
        }
    }
}
