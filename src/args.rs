use clap::Parser;

/// Replays a counting-circle event log and reports the tallied results.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (file path) The JSON file containing the ordered event log to replay.
    #[clap(value_parser)]
    pub events: String,

    /// (file path) A reference file containing the expected summary in JSON format. If provided,
    /// cctally will check that the replayed output matches the reference.
    #[clap(short, long, value_parser)]
    pub reference: Option<String>,

    /// (file path or empty) If specified, the summary of the replay will be written in JSON format
    /// to the given location instead of the standard output.
    #[clap(short, long, value_parser)]
    pub out: Option<String>,

    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false)]
    pub verbose: bool,
}
