pub mod external;
pub mod metabarcoding;

pub mod pe_merging;
pub mod primer_trimming;
pub mod quality_filtering;
pub mod dereplication;
pub mod denoising;
pub mod clustering;
pub mod replicate_merging;
pub mod nc_removal;
pub mod read_table;
