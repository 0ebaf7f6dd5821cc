use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use line_sort::{ExternalSorterBuilder, MergeStrategy};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let input = arg_parser.value_of("input").expect("value has default");
    let output = arg_parser.value_of("output").expect("value has default");
    let tmp_dir = arg_parser.value_of("tmp_dir").expect("value has default");
    let parallelism: usize = arg_parser.value_of_t_or_exit("parallel");
    let max_lines: usize = arg_parser.value_of_t_or_exit("max_lines");
    let read_ahead: usize = arg_parser.value_of_t_or_exit("read_ahead");
    let merge: Merge = arg_parser.value_of_t_or_exit("merge");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let buf_size = arg_parser
        .value_of("buf_size")
        .map(|v| v.parse::<ByteSize>().expect("value is pre-validated").as_u64() as usize);

    let mut sorter_builder = ExternalSorterBuilder::new()
        .with_parallelism(parallelism)
        .with_batch_size(max_lines)
        .with_tmp_dir(path::Path::new(tmp_dir))
        .with_merge_read_ahead(read_ahead)
        .with_merge_strategy(match merge {
            Merge::Linear => MergeStrategy::LinearScan,
            Merge::Heap => MergeStrategy::BinaryHeap,
        });

    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(buf_size) = buf_size {
        sorter_builder = sorter_builder.with_rw_buf_size(buf_size);
    }

    let sorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    match sorter.sort_file(path::Path::new(input), path::Path::new(output)) {
        Ok(summary) => log::info!(
            "{} records sorted ({} batches, {} spill files)",
            summary.output_records,
            summary.batches,
            summary.spill_files
        ),
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Merge {
    Linear,
    Heap,
}

impl Merge {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Merge::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Merge {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Merge as clap::ArgEnum>::from_str(s, false)
    }
}

fn validate_positive(v: &str) -> Result<(), String> {
    match v.parse::<usize>() {
        Ok(0) => Err("value must be positive".to_string()),
        Ok(_) => Ok(()),
        Err(err) => Err(format!("number format incorrect: {}", err)),
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("line-sort")
        .about("parallel external sorter for line-oriented files")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .takes_value(true)
                .default_value("in.tmp"),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .takes_value(true)
                .default_value("out.tmp"),
        )
        .arg(
            clap::Arg::new("parallel")
                .short('p')
                .long("parallel")
                .help("number of workers sorting batches concurrently")
                .takes_value(true)
                .default_value("16")
                .validator(validate_positive),
        )
        .arg(
            clap::Arg::new("max_lines")
                .short('m')
                .long("max-lines")
                .help("maximum number of lines per batch")
                .takes_value(true)
                .default_value("524288")
                .validator(validate_positive),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store spill files")
                .takes_value(true)
                .default_value("."),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for sorting a batch")
                .takes_value(true)
                .validator(validate_positive),
        )
        .arg(
            clap::Arg::new("buf_size")
                .short('b')
                .long("buf-size")
                .help("files read/write buffer size")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(size) if size.as_u64() > 0 => Ok(()),
                    Ok(_) => Err("Buffer size must be positive".to_string()),
                    Err(err) => Err(format!("Buffer size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("read_ahead")
                .short('r')
                .long("read-ahead")
                .help("number of lines read ahead from every spill file during the merge")
                .takes_value(true)
                .default_value("262144")
                .validator(validate_positive),
        )
        .arg(
            clap::Arg::new("merge")
                .long("merge")
                .help("merge strategy")
                .takes_value(true)
                .default_value("linear")
                .possible_values(Merge::possible_values()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
