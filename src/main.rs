use clap::{Parser, Subcommand};
use esprom::{
    cli::{
        self,
        DumpMemArgs,
        GlobalArgs,
        ImageInfoArgs,
        LoadRamArgs,
        MakeImageArgs,
        MakeSplitImageArgs,
        ReadMemArgs,
        RunArgs,
        Settings,
        WriteFlashArgs,
        WriteMemArgs,
    },
    logging::initialize_logger,
    Config,
};
use log::debug;
use miette::Result;

#[derive(Debug, Parser)]
#[command(about = "ESP8266 ROM bootloader utility", propagate_version = true, version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
#[command(rename_all = "snake_case")]
enum Commands {
    /// Download an image to RAM and execute it
    LoadRam(LoadRamArgs),
    /// Dump arbitrary memory to disk
    DumpMem(DumpMemArgs),
    /// Read an arbitrary memory location
    ReadMem(ReadMemArgs),
    /// Read-modify-write an arbitrary memory location
    WriteMem(WriteMemArgs),
    /// Write an ELF file to flash
    WriteFlash(WriteFlashArgs),
    /// Create a combined flash image from an ELF file
    MakeImage(MakeImageArgs),
    /// Create separate RAM and flash images from an ELF file
    MakeSplitImage(MakeSplitImageArgs),
    /// Run application code in flash
    Run(RunArgs),
    /// Dump the headers of an application image
    ImageInfo(ImageInfoArgs),
}

fn main() -> Result<()> {
    miette::set_panic_hook();

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let args = Cli::parse();
    initialize_logger(args.global.log_level);
    debug!("{:#?}", args);

    let config = Config::load()?;
    let settings = Settings::resolve(&args.global, &config);

    match args.subcommand {
        Commands::LoadRam(args) => cli::load_ram(args, &settings),
        Commands::DumpMem(args) => cli::dump_mem(args, &settings),
        Commands::ReadMem(args) => cli::read_mem(args, &settings),
        Commands::WriteMem(args) => cli::write_mem(args, &settings),
        Commands::WriteFlash(args) => cli::write_flash(args, &settings),
        Commands::MakeImage(args) => cli::make_image(args, &settings),
        Commands::MakeSplitImage(args) => cli::make_split_image(args, &settings),
        Commands::Run(args) => cli::run(args, &settings, &config),
        Commands::ImageInfo(args) => cli::image_info(args),
    }
}
