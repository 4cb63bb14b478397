pub mod fields {
    use std::path::PathBuf;

    use crate::schema::Schema;

    #[derive(clap::ValueEnum, Clone, Debug)]
    pub enum Format {
        Table,
        Json,
        Csv,
    }

    /// List the fields defined by a register map.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Path to the register map YAML file.
        schema: PathBuf,
        #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
        format: Format,
        filter: Option<String>,
        #[arg(long, short = 'o')]
        file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the register map")]
        Schema(#[source] crate::schema::Error),
        #[error("could not open the specified output file at {1:?}")]
        OpenOutputFile(#[source] std::io::Error, PathBuf),
        #[error("could not write data to the output file at {1:?}")]
        WriteFile(#[source] std::io::Error, PathBuf),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
        #[error("could not serialize fields to JSON")]
        SerializeJson(#[source] serde_json::Error),
        #[error("could not serialize fields to CSV")]
        SerializeCsv(#[source] csv::Error),
    }

    #[derive(serde::Serialize)]
    pub struct FieldRow {
        pub group: String,
        pub name: String,
        pub rule: String,
        pub registers: String,
        pub scale: f64,
        pub offset: Option<f64>,
        pub mask: Option<u16>,
        pub uom: Option<String>,
    }

    impl FieldRow {
        fn all_fields(schema: &Schema) -> impl Iterator<Item = FieldRow> + '_ {
            schema.parameters.iter().flat_map(|group| {
                group.items.iter().map(|field| FieldRow {
                    group: group.group.clone(),
                    name: field.name.clone(),
                    rule: field.rule.to_string(),
                    registers: field
                        .registers
                        .iter()
                        .map(|r| format!("{r:#06X}"))
                        .collect::<Vec<_>>()
                        .join(" "),
                    scale: field.scale,
                    offset: field.offset,
                    mask: field.mask,
                    uom: field.uom.clone(),
                })
            })
        }

        fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_uppercase();
            if self.name.to_uppercase().contains(&pattern) {
                return true;
            }
            if self.group.to_uppercase().contains(&pattern) {
                return true;
            }
            self.registers.contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let schema = Schema::load(&args.schema).map_err(Error::Schema)?;
        let mut output_writer: Box<dyn std::io::Write> = match &args.file {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };

        let matches = FieldRow::all_fields(&schema).filter(|row| match &args.filter {
            Some(pattern) => row.is_match(pattern),
            None => true,
        });
        let data = match args.format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                let header =
                    vec!["Group", "Name", "Rule", "Registers", "Scale", "Offset", "Mask", "Unit"];
                table
                    .set_header(header)
                    .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                for row in matches {
                    table.add_row(vec![
                        row.group,
                        row.name,
                        row.rule,
                        row.registers,
                        row.scale.to_string(),
                        row.offset.map(|v| v.to_string()).unwrap_or_default(),
                        row.mask.map(|v| format!("{v:#06X}")).unwrap_or_default(),
                        row.uom.unwrap_or_default(),
                    ]);
                }
                table.to_string().into_bytes()
            }
            Format::Json => {
                let value = matches.collect::<Vec<_>>();
                serde_json::to_vec(&value).map_err(Error::SerializeJson)?
            }
            Format::Csv => {
                let mut bytes = Vec::new();
                let mut writer = csv::Writer::from_writer(&mut bytes);
                for row in matches {
                    writer.serialize(row).map_err(Error::SerializeCsv)?;
                }
                drop(writer);
                bytes
            }
        };
        output_writer.write_all(&data).map_err(|e| match args.file {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p),
        })?;
        Ok(())
    }
}

pub mod read {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use crate::connection;
    use crate::inverter::{self, Inverter};
    use crate::parser::Value;
    use crate::schema::Schema;

    #[derive(clap::ValueEnum, Clone, Debug)]
    pub enum Format {
        Table,
        Json,
    }

    /// Poll the inverter and print the decoded dataset.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,

        /// Path to the register map YAML file.
        schema: PathBuf,

        /// Attempts per register range before the poll cycle is abandoned.
        #[arg(long, default_value = "3")]
        retries: u32,

        /// Keep polling with this period instead of reading once.
        #[arg(long)]
        repeat: Option<humantime::Duration>,

        #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
        format: Format,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the register map")]
        Schema(#[source] crate::schema::Error),
        #[error("could not create the async runtime")]
        CreateRuntime(#[source] std::io::Error),
        #[error("poll cycle failed")]
        Poll(#[source] inverter::Error),
        #[error("could not serialize the dataset to JSON")]
        SerializeJson(#[source] serde_json::Error),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let schema = Schema::load(&args.schema).map_err(Error::Schema)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::CreateRuntime)?;
        runtime.block_on(run_async(args, schema))
    }

    async fn run_async(args: Args, schema: Schema) -> Result<(), Error> {
        let mut inverter = Inverter::new(args.connection.config(), schema, args.retries);
        loop {
            match inverter.poll_once().await {
                Ok(()) => print_snapshot(&inverter, &args.format)?,
                // When watching, a failed cycle is worth reporting but not
                // worth dying over.
                Err(error) if args.repeat.is_some() => {
                    tracing::error!(
                        message = "poll cycle failed",
                        error = &error as &dyn std::error::Error
                    );
                }
                Err(error) => return Err(Error::Poll(error)),
            }
            let Some(period) = args.repeat else {
                return Ok(());
            };
            tokio::time::sleep(*period).await;
        }
    }

    fn print_snapshot(inverter: &Inverter, format: &Format) -> Result<(), Error> {
        let units: BTreeMap<&str, &str> = inverter
            .fields()
            .filter_map(|f| Some((f.name.as_str(), f.uom.as_deref()?)))
            .collect();
        // Sorted for stable output between polls.
        let values: BTreeMap<&String, &Value> = inverter.snapshot().into_iter().flatten().collect();
        let last_update = inverter.last_update().map(|t| t.to_string()).unwrap_or_default();
        let rendered = match format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                table
                    .set_header(vec!["Field", "Value", "Unit"])
                    .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                for (name, value) in values {
                    table.add_row(vec![
                        name.clone(),
                        value.to_string(),
                        units.get(name.as_str()).unwrap_or(&"").to_string(),
                    ]);
                }
                format!("{table}\nstate: {} at {last_update}\n", inverter.connection_state())
            }
            Format::Json => {
                #[derive(serde::Serialize)]
                struct Output<'a> {
                    state: String,
                    last_update: String,
                    values: BTreeMap<&'a String, &'a Value>,
                }
                let output = Output {
                    state: inverter.connection_state().to_string(),
                    last_update,
                    values,
                };
                let mut rendered = serde_json::to_string(&output).map_err(Error::SerializeJson)?;
                rendered.push('\n');
                rendered
            }
        };
        use std::io::Write as _;
        std::io::stdout().lock().write_all(rendered.as_bytes()).map_err(Error::WriteStdout)
    }
}

pub mod write {
    use crate::connection::{self, Connection};
    use crate::v5::Operation;

    /// Write one or more holding registers.
    ///
    /// A single value becomes a function code 6 write, multiple values a
    /// function code 16 write to consecutive registers. Writes are sent
    /// exactly once; a failure leaves it to the operator to check the
    /// inverter state before repeating.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,

        /// Address of the first register to write.
        address: u16,

        /// The value(s) to write.
        #[arg(required = true)]
        values: Vec<u16>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not create the async runtime")]
        CreateRuntime(#[source] std::io::Error),
        #[error("the write was not acknowledged")]
        Write(#[source] connection::Error),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::CreateRuntime)?;
        runtime.block_on(run_async(args))
    }

    async fn run_async(args: Args) -> Result<(), Error> {
        let mut connection =
            Connection::connect(args.connection.config()).await.map_err(Error::Write)?;
        let operation = match args.values.as_slice() {
            &[value] => Operation::WriteHolding { address: args.address, value },
            values => Operation::WriteHoldings { address: args.address, values: values.to_vec() },
        };
        let result = connection.send(operation).await;
        let _ = connection.disconnect().await;
        let echo = result.map_err(Error::Write)?;
        use std::io::Write as _;
        writeln!(std::io::stdout().lock(), "acknowledged: {echo:?}").map_err(Error::WriteStdout)
    }
}
