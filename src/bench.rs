//! Benchmarks for the append and consolidation path
