pub mod build_log;
pub mod canon;
pub mod densemap;
pub mod depfile;
pub mod deps_log;
pub mod dyndep;
pub mod eval;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod load;
pub mod parse;
pub mod progress;
pub mod run;
pub mod scan;
pub mod scanner;
pub mod signal;
pub mod smallmap;
pub mod task;
pub mod terminal;
pub mod trace;
pub mod work;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
