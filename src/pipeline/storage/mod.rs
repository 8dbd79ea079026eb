// Pipeline storage: curated commits and prod partitions

pub mod curated_writer;
pub mod partition_writer;
