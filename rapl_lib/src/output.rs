use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
};

use serde::Serialize;

use crate::{config::OutputType, session::MeasurementResult};

/// Where the measurements are written after each session.
pub enum ResultSink {
    None,
    /// One line per domain: `<domain>,<energy_uj>,<duration_us>`
    Stdout,
    /// Appends rows to a CSV file
    Csv(csv::Writer<File>),
}

#[derive(Serialize)]
struct CsvRow<'a> {
    domain: &'a str,
    socket: u32,
    energy_uj: u64,
    duration_us: u64,
    wrapped: bool,
}

impl ResultSink {
    pub fn open(output: OutputType, csv_path: &Path) -> io::Result<ResultSink> {
        match output {
            OutputType::None => Ok(ResultSink::None),
            OutputType::Stdout => Ok(ResultSink::Stdout),
            OutputType::Csv => ResultSink::csv(csv_path),
        }
    }

    /// Opens `path` in append mode. The header is only written if the file is empty.
    pub fn csv(path: &Path) -> io::Result<ResultSink> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        let is_new = file.metadata()?.len() == 0;
        let writer = csv::WriterBuilder::new().has_headers(is_new).from_writer(file);
        Ok(ResultSink::Csv(writer))
    }

    pub fn write(&mut self, results: &[MeasurementResult]) -> io::Result<()> {
        match self {
            ResultSink::None => Ok(()),
            ResultSink::Stdout => {
                let mut out = io::stdout().lock();
                write_lines(&mut out, results)?;
                out.flush()
            }
            ResultSink::Csv(writer) => {
                for r in results {
                    writer.serialize(CsvRow {
                        domain: r.domain.domain.name(),
                        socket: r.domain.socket,
                        energy_uj: r.energy_uj,
                        duration_us: r.duration_us(),
                        wrapped: r.wrapped,
                    })?;
                }
                // flush after each session: the process can be killed at any time by the harness
                writer.flush()
            }
        }
    }
}

fn write_lines(out: &mut impl Write, results: &[MeasurementResult]) -> io::Result<()> {
    for r in results {
        writeln!(out, "{},{},{}", r.domain, r.energy_uj, r.duration_us())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use rapl_probes::{DomainId, RaplDomainType};

    use super::{write_lines, ResultSink};
    use crate::{config::OutputType, session::MeasurementResult};

    fn results() -> [MeasurementResult; 2] {
        [
            MeasurementResult {
                domain: DomainId::package(0),
                energy_uj: 1234,
                duration: Duration::from_micros(56),
                wrapped: false,
            },
            MeasurementResult {
                domain: DomainId::new(1, RaplDomainType::Dram),
                energy_uj: 7,
                duration: Duration::from_nanos(8_900),
                wrapped: true,
            },
        ]
    }

    #[test]
    fn test_stdout_format() {
        let mut buf = Vec::new();
        write_lines(&mut buf, &results()).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "package-0,1234,56\ndram-1,7,8\n");
    }

    #[test]
    fn test_csv_appends() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.csv");

        let mut sink = ResultSink::open(OutputType::Csv, &path)?;
        sink.write(&results())?;
        drop(sink);

        // reopening must not repeat the header
        let mut sink = ResultSink::csv(&path)?;
        sink.write(&results()[..1])?;

        let content = fs::read_to_string(&path)?;
        assert_eq!(
            content,
            "domain,socket,energy_uj,duration_us,wrapped\n\
             package,0,1234,56,false\n\
             dram,1,7,8,true\n\
             package,0,1234,56,false\n"
        );
        Ok(())
    }

    #[test]
    fn test_none() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("never.csv");
        let mut sink = ResultSink::open(OutputType::None, &path)?;
        sink.write(&results())?;
        assert!(!path.exists());
        Ok(())
    }
}
