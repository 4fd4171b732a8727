use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use super::sources::{ColumnRef, EventRow, EventTable, SourceError};
use super::spatial;

/// One component of a composite group key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupDimension {
    Column(String),
    H3Cell { resolution: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueFilter {
    pub column: String,
    pub values: BTreeSet<String>,
}

/// How rows are bucketed into groups. Stages that share a scheme share its series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupingScheme {
    pub dimensions: Vec<GroupDimension>,
    pub filter: Option<ValueFilter>,
    /// Drop rows without a plausible coordinate even when no dimension is spatial.
    pub require_coordinates: bool,
}

impl GroupingScheme {
    pub fn columns(columns: &[&str]) -> Self {
        Self {
            dimensions: columns
                .iter()
                .map(|c| GroupDimension::Column(c.to_string()))
                .collect(),
            filter: None,
            require_coordinates: false,
        }
    }

    fn needs_coordinates(&self) -> bool {
        self.require_coordinates
            || self
                .dimensions
                .iter()
                .any(|d| matches!(d, GroupDimension::H3Cell { .. }))
    }
}

pub type GroupKey = Vec<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WeekCount {
    pub week: NaiveDate,
    pub count: u64,
}

/// Contiguous weekly counts starting at a Monday. Gaps are explicit zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklySeries {
    start: NaiveDate,
    counts: Vec<u64>,
}

impl WeeklySeries {
    /// Densifies sparse week buckets from the first observed week through `through`.
    pub fn from_sparse(weeks: &BTreeMap<NaiveDate, u64>, through: NaiveDate) -> Option<Self> {
        let (&first, _) = weeks.iter().next()?;
        let start = week_start(first);
        let end = week_start(through).max(start);
        let len = ((end - start).num_days() / 7) as usize + 1;
        let mut counts = vec![0u64; len];
        for (week, count) in weeks {
            let idx = ((week_start(*week) - start).num_days() / 7) as usize;
            if let Some(slot) = counts.get_mut(idx) {
                *slot += count;
            }
        }
        Some(Self { start, counts })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn week_at(&self, idx: usize) -> NaiveDate {
        self.start + Duration::weeks(idx as i64)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn points(&self) -> Vec<WeekCount> {
        self.counts
            .iter()
            .enumerate()
            .map(|(idx, count)| WeekCount {
                week: self.week_at(idx),
                count: *count,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct GroupedTimeSeries {
    pub scheme: GroupingScheme,
    /// Monday of the dataset's last observed week; every series ends here.
    pub through: Option<NaiveDate>,
    pub groups: BTreeMap<GroupKey, WeeklySeries>,
}

pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

enum ResolvedDimension {
    Column(ColumnRef),
    H3Cell(u8),
}

/// Resamples event rows into weekly counts per composite group key.
///
/// Rows with an empty grouping value are skipped. Spatial schemes also skip rows with
/// missing, out-of-range or placeholder coordinates.
pub fn build_weekly_series(
    table: &EventTable,
    scheme: &GroupingScheme,
) -> Result<GroupedTimeSeries, SourceError> {
    let dimensions = scheme
        .dimensions
        .iter()
        .map(|dimension| match dimension {
            GroupDimension::Column(name) => table.column(name).map(ResolvedDimension::Column),
            GroupDimension::H3Cell { resolution } => Ok(ResolvedDimension::H3Cell(*resolution)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let filter = match &scheme.filter {
        Some(filter) => Some((table.column(&filter.column)?, &filter.values)),
        None => None,
    };
    let needs_coordinates = scheme.needs_coordinates();

    let mut sparse: BTreeMap<GroupKey, BTreeMap<NaiveDate, u64>> = BTreeMap::new();
    let mut skipped = 0usize;
    for row in &table.rows {
        if let Some((column, allowed)) = &filter {
            if !allowed.contains(table.value(row, column)) {
                continue;
            }
        }
        if needs_coordinates && !row_has_plausible_coordinates(row) {
            skipped += 1;
            continue;
        }
        let Some(key) = group_key(table, row, &dimensions) else {
            skipped += 1;
            continue;
        };
        *sparse
            .entry(key)
            .or_default()
            .entry(week_start(row.timestamp.date()))
            .or_insert(0) += 1;
    }

    let through = table.max_timestamp().map(|ts| week_start(ts.date()));
    let groups = match through {
        Some(through) => sparse
            .into_iter()
            .filter_map(|(key, weeks)| WeeklySeries::from_sparse(&weeks, through).map(|s| (key, s)))
            .collect(),
        None => BTreeMap::new(),
    };

    tracing::debug!(
        groups = groups.len(),
        skipped_rows = skipped,
        "built weekly series"
    );

    Ok(GroupedTimeSeries {
        scheme: scheme.clone(),
        through,
        groups,
    })
}

fn row_has_plausible_coordinates(row: &EventRow) -> bool {
    matches!(row.coords, Some((lat, lon)) if spatial::is_plausible_coordinate(lat, lon))
}

fn group_key(table: &EventTable, row: &EventRow, dimensions: &[ResolvedDimension]) -> Option<GroupKey> {
    let mut key = Vec::with_capacity(dimensions.len());
    for dimension in dimensions {
        match dimension {
            ResolvedDimension::Column(column) => {
                let value = table.value(row, column);
                if value.is_empty() {
                    return None;
                }
                key.push(value.to_string());
            }
            ResolvedDimension::H3Cell(resolution) => {
                let (lat, lon) = row.coords?;
                let cell = spatial::cell_for(lat, lon, *resolution).ok()?;
                key.push(cell.to_string());
            }
        }
    }
    Some(key)
}
