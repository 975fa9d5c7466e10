//! Shared fixtures for integration tests

#![allow(dead_code)]

use batchloop::composite::{FieldReader, FileCounter, ListCollector, SumCollector, UnitCounter};
use batchloop::{ReaderCollectorComposite, WorkUnit};

/// Three datasets, one of them split across several files
pub fn datasets() -> Vec<WorkUnit> {
    vec![
        WorkUnit::new("TTJets")
            .with_files(["ttjets_1.root", "ttjets_2.root", "ttjets_3.root"])
            .with_metadata("xsec", 831.76),
        WorkUnit::new("WJets")
            .with_files(["wjets_1.root"])
            .with_metadata("xsec", 61526.7),
        WorkUnit::new("DYJets")
            .with_files(["dy_1.root", "dy_2.root"])
            .with_metadata("xsec", 6025.2),
    ]
}

/// Composite built only from kinds the worker binary knows
pub fn counting_composite() -> ReaderCollectorComposite {
    let mut composite = ReaderCollectorComposite::new();
    composite.add(UnitCounter, SumCollector::default());
    composite.add(FileCounter, SumCollector::default());
    composite.add(FieldReader::new("xsec"), ListCollector::default());
    composite
}
