use clap::{ Args, Parser, Subcommand };
use confcom_policygen::config::GenerateOptions;
use confcom_policygen::confirm::{ AutoConfirm, ConfirmationSource, StdinConfirmation };
use confcom_policygen::input::parse_fragment_imports;
use confcom_policygen::policy::Fragment;
use confcom_policygen::populate::ImageInspector;
use confcom_policygen::registry::{ ManifestInspector, RegistryInspector };
use confcom_policygen::serialize::{ self, OutputType };
use confcom_policygen::{ PolicyError, PolicyResult };
use std::error::Error;
use std::io::IsTerminal;
use std::path::{ Path, PathBuf };
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "confcom-policygen", version, about = "Generate security policies for confidential container groups")]
struct Cli {
  /// Log at debug level unless RUST_LOG says otherwise
  #[arg(long, short, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Generate a policy and inject it into the template
  Generate(GenerateArgs),
  /// Compare the policy embedded in a template with a freshly generated one
  Diff(DiffArgs),
  /// Print the Rego of the policy embedded in a template
  PrintExisting(TemplateArgs),
}

#[derive(Args)]
struct TemplateArgs {
  #[arg(long, short = 'a')]
  template: PathBuf,
  #[arg(long, short = 'p')]
  parameters: Option<PathBuf>,
}

#[derive(Args)]
struct GenerateArgs {
  #[arg(long, short = 'a', required_unless_present = "input", conflicts_with = "input")]
  template: Option<PathBuf>,
  #[arg(long, short = 'p', requires = "template")]
  parameters: Option<PathBuf>,
  /// Policy-content JSON instead of an ARM template
  #[arg(long, short = 'i')]
  input: Option<PathBuf>,
  #[arg(long)]
  infrastructure_svn: Option<String>,
  #[arg(long)]
  disable_stdio: bool,
  /// Accept every wildcard prompt
  #[arg(long, short = 'y')]
  approve_wildcards: bool,
  #[arg(long)]
  debug_mode: bool,
  #[arg(long)]
  exclude_default_fragments: bool,
  #[arg(long)]
  outraw: bool,
  #[arg(long)]
  outraw_pretty_print: bool,
  #[arg(long)]
  json: bool,
  /// Print the containers without the Rego boilerplate
  #[arg(long)]
  no_boilerplate: bool,
  #[arg(long)]
  print_policy: bool,
  /// JSON file of image contents used instead of the registry
  #[arg(long)]
  image_manifest: Option<PathBuf>,
  /// JSON file whose `fragments` and `standaloneFragments` become fragment imports
  #[arg(long)]
  fragments_json: Option<PathBuf>,
}

#[derive(Args)]
struct DiffArgs {
  #[command(flatten)]
  template: TemplateArgs,
  #[arg(long)]
  image_manifest: Option<PathBuf>,
  #[arg(long)]
  fragments_json: Option<PathBuf>,
  #[arg(long, short = 'y')]
  approve_wildcards: bool,
  #[arg(long)]
  outraw_pretty_print: bool,
}

fn read(path: &Path) -> PolicyResult<String> {
  std::fs::read_to_string(path).map_err(|source| PolicyError::Read { path: path.to_owned(), source })
}

fn read_optional(path: &Option<PathBuf>) -> PolicyResult<Option<String>> {
  path.as_deref().map(read).transpose()
}

fn inspector(manifest: &Option<PathBuf>) -> PolicyResult<Box<dyn ImageInspector>> {
  let inspector: Box<dyn ImageInspector> = match manifest {
    Some(path) => Box::new(ManifestInspector::load(path)?),
    None => Box::new(RegistryInspector::new()?),
  };

  Ok(inspector)
}

fn fragment_imports(path: &Option<PathBuf>) -> PolicyResult<Vec<Fragment>> {
  match read_optional(path)? {
    Some(text) => parse_fragment_imports(&text),
    None => Ok(vec![]),
  }
}

fn confirmation(approve_wildcards: bool) -> Box<dyn ConfirmationSource> {
  if approve_wildcards {
    Box::new(AutoConfirm(true))
  } else if std::io::stdin().is_terminal() {
    Box::new(StdinConfirmation)
  } else {
    Box::new(AutoConfirm(false))
  }
}

fn generate(args: &GenerateArgs) -> PolicyResult<bool> {
  let options = GenerateOptions {
    infrastructure_svn: args.infrastructure_svn.clone(),
    disable_stdio: args.disable_stdio,
    debug_mode: args.debug_mode,
    exclude_default_fragments: args.exclude_default_fragments,
    fragment_imports: fragment_imports(&args.fragments_json)?,
  };
  let inspector = inspector(&args.image_manifest)?;

  let output_type = if args.outraw_pretty_print {
    OutputType::PrettyPrint
  } else if args.outraw {
    OutputType::Raw
  } else {
    OutputType::Default
  };

  if let Some(input) = &args.input {
    let policy = confcom_policygen::generate_from_input(&read(input)?, &options, inspector.as_ref())?;
    println!("{}", serialize::serialize(&policy, output_type, args.json, !args.no_boilerplate)?);
    return Ok(true);
  }

  let template_path = match &args.template {
    Some(path) => path,
    None => return Ok(false),
  };
  let mut template = read(template_path)?;
  let parameters = read_optional(&args.parameters)?;
  let confirm = confirmation(args.approve_wildcards);

  let policies = confcom_policygen::generate_from_template(
    &template,
    parameters.as_deref(),
    &options,
    confirm.as_ref(),
    inspector.as_ref(),
  )?;

  if args.print_policy || args.outraw || args.outraw_pretty_print {
    for generated in &policies {
      println!("CCE Policy for Container Group: {}", generated.group);
      println!("{}", serialize::serialize(&generated.policy, output_type, args.json, !args.no_boilerplate)?);
    }
    return Ok(true);
  }

  for (index, generated) in policies.iter().enumerate() {
    let raw = serialize::serialize(&generated.policy, OutputType::Raw, args.json, !args.no_boilerplate)?;
    let encoded = serialize::serialize(&generated.policy, OutputType::Default, args.json, !args.no_boilerplate)?;

    template = confcom_policygen::inject_policy(&template, index, &encoded)?;
    println!("{}", serialize::sha256_hex(&raw));
  }

  std::fs::write(template_path, template).map_err(|source| PolicyError::Write { path: template_path.clone(), source })?;
  tracing::info!("wrote {} policies into {}", policies.len(), template_path.display());

  Ok(true)
}

fn diff(args: &DiffArgs) -> PolicyResult<bool> {
  let template = read(&args.template.template)?;
  let parameters = read_optional(&args.template.parameters)?;
  let inspector = inspector(&args.image_manifest)?;
  let confirm = confirmation(args.approve_wildcards);
  let options = GenerateOptions { fragment_imports: fragment_imports(&args.fragments_json)?, ..GenerateOptions::default() };

  let results = confcom_policygen::diff_against_template(
    &template,
    parameters.as_deref(),
    &options,
    confirm.as_ref(),
    inspector.as_ref(),
  )?;

  let mut valid = true;
  for (group, result) in &results {
    if result.is_valid {
      println!("Existing policy of container group {} is compatible with the template", group);
      continue;
    }

    valid = false;
    let rendered = if args.outraw_pretty_print {
      serde_json::to_string_pretty(&result.diff)
    } else {
      serde_json::to_string(&result.diff)
    };
    println!("Existing policy of container group {} differs from the template:", group);
    println!("{}", rendered.map_err(PolicyError::json("policy diff"))?);
  }

  Ok(valid)
}

fn print_existing(args: &TemplateArgs) -> PolicyResult<bool> {
  let template = read(&args.template)?;
  let parameters = read_optional(&args.parameters)?;

  for (group, rego) in confcom_policygen::print_existing_policy(&template, parameters.as_deref())? {
    println!("CCE Policy for Container Group: {}", group);
    println!("{}", rego);
  }

  Ok(true)
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

  let outcome = match &cli.command {
    Command::Generate(args) => generate(args),
    Command::Diff(args) => diff(args),
    Command::PrintExisting(args) => print_existing(args),
  };

  match outcome {
    Ok(true) => ExitCode::SUCCESS,
    Ok(false) => ExitCode::FAILURE,
    Err(e) => {
      tracing::error!("{}", e);
      let mut source = e.source();
      while let Some(cause) = source {
        tracing::error!("  caused by: {}", cause);
        source = cause.source();
      }
      ExitCode::FAILURE
    }
  }
}
