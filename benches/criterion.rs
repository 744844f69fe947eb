use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use unpickle_json::{convert, pickle};

criterion_main!(small, large);

criterion_group! {
  name = small;
  config = Criterion::default();
  targets = small_job_protocol_0,
            small_job_protocol_4,
}

criterion_group! {
  name = large;
  config = Criterion::default().measurement_time(Duration::from_secs(30));
  targets = large_results_to_json,
            large_results_decode,
            large_results_convert,
}

macro_rules! unpickle_benchmark {
  (
    name    = $name:ident;
    input   = $input:expr;
    sources = $($source:ident),+;
    $(group_config { $($setting_name:ident = $setting_value:expr;)* })?
  ) => {
    fn $name(c: &mut Criterion) {
      let mut group = c.benchmark_group(stringify!($name));
      let input: &[u8] = $input;

      $($(group.$setting_name($setting_value);)*)?

      $(
        group.bench_function(stringify!($source), |b| {
          b.iter(|| unpickle_benchmark!(@unpickle $source black_box(input)))
        });
      )+

      group.finish();
    }
  };
  (@unpickle slice $input:expr) => { unpickle_json::unpickle_slice($input, std::io::sink()) };
  (@unpickle reader $input:expr) => { unpickle_json::unpickle_reader($input, std::io::sink()) };
}

unpickle_benchmark! {
  name    = small_job_protocol_0;
  input   = include_bytes!("../tests/pickles/job.p0.pickle");
  sources = slice, reader;
}

unpickle_benchmark! {
  name    = small_job_protocol_4;
  input   = include_bytes!("../tests/pickles/job.p4.pickle");
  sources = slice, reader;
}

// A list of 2,000 ARQ-style job results, a mix of successes with datetime
// fields and failures with exceptions.
static LARGE_RESULTS: &[u8] = include_bytes!("job-results.pickle");

unpickle_benchmark! {
  name    = large_results_to_json;
  input   = LARGE_RESULTS;
  sources = slice, reader;
  group_config {
    sample_size = 50;
  }
}

fn large_results_decode(c: &mut Criterion) {
  c.bench_function("large_results_decode", |b| {
    b.iter(|| pickle::from_slice(black_box(LARGE_RESULTS)))
  });
}

fn large_results_convert(c: &mut Criterion) {
  let value = pickle::from_slice(LARGE_RESULTS).expect("failed to decode test data");
  c.bench_function("large_results_convert", |b| {
    b.iter(|| convert::to_json(black_box(&value)))
  });
}
