use std::path::PathBuf;
use std::process::exit;

use env_logger::Env;
use structopt::StructOpt;

use nfc_staticnested::attack::{InputArguments, PwnHost};
use nfc_staticnested::mifare::{sector_count, MifareCard, MifareClassicInitiator, MifareKey};
use nfc_staticnested::nfc::Transceiver;
use nfc_staticnested::{NfcError, NfcResult};

/// Recovers the unknown sector keys of a MIFARE Classic tag whose nonce
/// generator is static, starting from a single known key, and optionally
/// dumps the full card.
#[derive(StructOpt, Debug)]
#[structopt(name = "nfc-staticnested", max_term_width = 100)]
struct Args {
    /// Transport connection string, e.g. "pn532_uart:/dev/ttyUSB0".
    /// Scans for the first available device if omitted.
    #[structopt(short = "c", long)]
    connstring: Option<String>,

    /// Card geometry: mini, 1k, 2k or 4k.
    #[structopt(short = "m", long, default_value = "1k", parse(try_from_str = parse_card_type))]
    mifare_classic: MifareCard,

    /// Disable the optimization for tags answering Nt_1 = 0x009080A2.
    #[structopt(long)]
    force_detect_distance: bool,

    /// Dump all valid keys to a text file.
    #[structopt(long, parse(from_os_str))]
    dump_keys: Option<PathBuf>,

    /// Dump the full card into a binary file.
    #[structopt(short = "d", long, parse(from_os_str))]
    dump: Option<PathBuf>,

    /// Skip the four well-known factory default keys.
    #[structopt(long)]
    no_default_keys: bool,

    /// Add a key to the default key test list (12 hex digits).
    #[structopt(short = "k", long = "key", number_of_values = 1, parse(try_from_str = parse_key))]
    keys: Vec<u64>,

    /// Attack a single sector instead of every unknown one; the dump
    /// function may fail.
    #[structopt(long)]
    target_sector: Option<u8>,

    /// Key type to attack when --target-sector is given: a or b.
    #[structopt(long, parse(try_from_str = parse_key_type))]
    target_key_type: Option<MifareKey>,
}

fn parse_card_type(s: &str) -> Result<MifareCard, String> {
    match s {
        "mini" => Ok(MifareCard::ClassicMini),
        "1k" => Ok(MifareCard::Classic1K),
        "2k" => Ok(MifareCard::Classic2K),
        "4k" => Ok(MifareCard::Classic4K),
        _ => Err(format!("unknown card type: {}", s)),
    }
}

fn parse_key(s: &str) -> Result<u64, String> {
    let key = u64::from_str_radix(s, 16)
        .map_err(|_| format!("not a hexadecimal key: {}", s))?;
    if key >= 1 << 48 {
        return Err("The input key must be 48 bits, for example: A1A2A3A4A5A6.".to_owned());
    }
    Ok(key)
}

fn parse_key_type(s: &str) -> Result<MifareKey, String> {
    match s {
        "a" | "A" => Ok(MifareKey::A),
        "b" | "B" => Ok(MifareKey::B),
        _ => Err(format!("unknown key type: {}", s)),
    }
}

fn main() {
    env_logger::init_from_env(Env::new().default_filter_or("nfc_staticnested=info"));

    if let Err(e) = run(Args::from_args()) {
        println!("{}", e);
        exit(1);
    }
}

fn run(args: Args) -> NfcResult<()> {
    if args.target_sector.is_some() != args.target_key_type.is_some() {
        return Err(NfcError::Precondition(
            "--target-sector and --target-key-type must be provided together.".to_owned(),
        ));
    }
    if let Some(sector) = args.target_sector {
        if sector >= sector_count(args.mifare_classic) {
            return Err(NfcError::Precondition(format!(
                "Sector {} does not exist on this card type.",
                sector
            )));
        }
    }

    let mut context = nfc1::Context::new()?;
    let mut device = match &args.connstring {
        Some(connstring) => context.open_with_connstring(connstring)?,
        None => context.open()?,
    };
    device.initiator_init()?;
    println!("NFC device opened: {}", device.name());

    let mut transceiver = Transceiver::Device(device);
    transceiver.enter_raw_mode()?;

    let input = InputArguments {
        card_type: args.mifare_classic,
        force_detect_distance: args.force_detect_distance,
        dump_keys: args.dump_keys,
        dump: args.dump,
        no_default_keys: args.no_default_keys,
        user_keys: args.keys,
        target_sector: args.target_sector,
        target_key_type: args.target_key_type,
    };

    let host = PwnHost::new(MifareClassicInitiator::new(&mut transceiver), &input);
    host.run()?;

    Ok(())
}
