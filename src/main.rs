use std::env::set_var;
use std::fs::File;
use std::io;
use std::io::Read;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{arg, command, ArgAction, ArgMatches, Command};
use log::*;
use rsif::utils::init_logs;
use rsif::{
    with_id, AddOpts, Arch, CreateOpts, DataType, DeleteOpts, Descriptor, DescriptorInput,
    FileImage, FsType, LoadOpts, PartType, SetOpts,
};

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
            .action(ArgAction::SetTrue)
            .global(true))
        .subcommand(Command::new("new")
            .about("Create an empty image")
            .arg(arg!(<file> "Image path")))
        .subcommand(Command::new("header")
            .about("Print the global header")
            .arg(arg!(<file> "Image path")))
        .subcommand(Command::new("list")
            .about("List data objects")
            .arg(arg!(<file> "Image path")))
        .subcommand(Command::new("info")
            .about("Print one data object in detail")
            .arg(arg!(<file> "Image path"))
            .arg(arg!(<id> "Object ID")))
        .subcommand(Command::new("dump")
            .about("Write an object payload to stdout")
            .arg(arg!(<file> "Image path"))
            .arg(arg!(<id> "Object ID")))
        .subcommand(Command::new("add")
            .about("Add a data object")
            .arg(arg!(<file> "Image path"))
            .arg(arg!(<input> "Payload path, or '-' for stdin"))
            .arg(arg!(-t --datatype <TYPE> "deffile|envvar|labels|partition|signature|genericjson|generic|cryptomessage|sbom|ocirootindex|ociblob")
                .required(false)
                .default_value("generic"))
            .arg(arg!(-n --name <NAME> "Logical object name").required(false))
            .arg(arg!(-g --groupid <ID> "Owning group ID").required(false))
            .arg(arg!(--nogroup "Opt out of grouping").action(ArgAction::SetTrue))
            .arg(arg!(--link <ID> "Linked object ID").required(false))
            .arg(arg!(--linkgroup <ID> "Linked group ID").required(false))
            .arg(arg!(--alignment <BYTES> "Payload start alignment").required(false))
            .arg(arg!(--fstype <FS> "squashfs|ext3|immuobj|raw|encryptsquashfs (partition only)").required(false))
            .arg(arg!(--parttype <PART> "system|primsys|data|overlay (partition only)").required(false))
            .arg(arg!(--arch <ARCH> "Partition architecture, e.g. amd64").required(false)))
        .subcommand(Command::new("del")
            .about("Delete a data object")
            .arg(arg!(<file> "Image path"))
            .arg(arg!(<id> "Object ID"))
            .arg(arg!(--zero "Overwrite the payload with zeros").action(ArgAction::SetTrue))
            .arg(arg!(--compact "Reclaim the payload bytes").action(ArgAction::SetTrue)))
        .subcommand(Command::new("setprim")
            .about("Set the primary system partition")
            .arg(arg!(<file> "Image path"))
            .arg(arg!(<id> "Object ID")))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();

    match matches.subcommand() {
        Some(("new", sub)) => cmd_new(sub),
        Some(("header", sub)) => cmd_header(sub),
        Some(("list", sub)) => cmd_list(sub),
        Some(("info", sub)) => cmd_info(sub),
        Some(("dump", sub)) => cmd_dump(sub),
        Some(("add", sub)) => cmd_add(sub),
        Some(("del", sub)) => cmd_del(sub),
        Some(("setprim", sub)) => cmd_setprim(sub),
        _ => unreachable!(),
    }
}

fn file_arg(sub: &ArgMatches) -> &String {
    sub.get_one::<String>("file").unwrap()
}

fn id_arg(sub: &ArgMatches) -> Result<u32> {
    let raw = sub.get_one::<String>("id").unwrap();
    raw.parse().map_err(|_| anyhow!("bad object ID {:?}", raw))
}

fn utc_time(secs: i64) -> String {
    if secs == 0 {
        return "-".to_string();
    }
    match NaiveDateTime::from_timestamp_opt(secs, 0) {
        Some(naive) => DateTime::<Utc>::from_utc(naive, Utc)
            .format("%Y-%m-%d %H:%M:%S UTC")
            .to_string(),
        None => secs.to_string(),
    }
}

fn cmd_new(sub: &ArgMatches) -> Result<()> {
    let file = file_arg(sub);
    let image = FileImage::create(file, CreateOpts::new())?;
    info!("created {} ({})", file, image.id());
    image.unload()?;
    Ok(())
}

fn cmd_header(sub: &ArgMatches) -> Result<()> {
    let image = FileImage::load(file_arg(sub), LoadOpts::new().read_only(true))?;
    println!("Launch:             {:?}", image.launch_script());
    println!("Version:            {}", image.version());
    println!("Arch:               {}", image.arch());
    println!("ID:                 {}", image.id());
    println!("Created:            {}", utc_time(image.created_at()));
    println!("Modified:           {}", utc_time(image.modified_at()));
    println!("Descriptors Free:   {}", image.descriptors_free());
    println!("Descriptors Total:  {}", image.descriptors_total());
    println!("Descriptors Offset: {}", image.descriptors_offset());
    println!("Descriptors Size:   {}", image.descriptors_size());
    println!("Data Offset:        {}", image.data_offset());
    println!("Data Size:          {}", image.data_size());
    image.unload()?;
    Ok(())
}

fn type_label(d: &Descriptor) -> String {
    match d.data_type() {
        Ok(dt) => dt.to_string(),
        Err(_) => format!("Unknown ({:#x})", d.data_type_code()),
    }
}

fn cmd_list(sub: &ArgMatches) -> Result<()> {
    let image = FileImage::load(file_arg(sub), LoadOpts::new().read_only(true))?;
    println!(
        "{:<4}|{:<6}|{:<8}|{:<22}|{:<10}|NAME",
        "ID", "GROUP", "LINK", "TYPE", "SIZE"
    );
    image.with_descriptors(|d| {
        let group = match d.group_id() {
            0 => "NONE".to_string(),
            gid => gid.to_string(),
        };
        let link = match d.linked_id() {
            (0, _) => "NONE".to_string(),
            (id, true) => format!("{} (G)", id),
            (id, false) => id.to_string(),
        };
        println!(
            "{:<4}|{:<6}|{:<8}|{:<22}|{:<10}|{}",
            d.id(),
            group,
            link,
            type_label(d),
            d.size(),
            d.name()
        );
        Ok(false)
    })?;
    image.unload()?;
    Ok(())
}

fn cmd_info(sub: &ArgMatches) -> Result<()> {
    let image = FileImage::load(file_arg(sub), LoadOpts::new().read_only(true))?;
    let d = image.get_descriptor(&[with_id(id_arg(sub)?)])?;
    println!("Type:     {}", type_label(&d));
    println!("ID:       {}", d.id());
    println!("Group:    {}", d.group_id());
    println!("Link:     {:?}", d.linked_id());
    println!("Offset:   {}", d.offset());
    println!("Size:     {}", d.size());
    println!("Name:     {}", d.name());
    println!("Created:  {}", utc_time(d.created_at()));
    println!("Modified: {}", utc_time(d.modified_at()));
    match d.data_type() {
        Ok(DataType::Partition) => {
            let p = d.partition_metadata()?;
            println!("Fstype:   {}", p.fs_type);
            println!("Parttype: {}", p.part_type);
            println!("Arch:     {}", p.arch);
        }
        Ok(DataType::Signature) => {
            let s = d.signature_metadata()?;
            println!("Hashtype: {:?}", s.hash_type);
            let entity: Vec<String> = s.entity.iter().map(|b| format!("{:02X}", b)).collect();
            println!("Entity:   {}", entity.join(""));
        }
        Ok(DataType::CryptoMessage) => {
            let m = d.crypto_message_metadata()?;
            println!("Format:   {:?}", m.format_type);
            println!("Message:  {:?}", m.message_type);
        }
        Ok(DataType::Sbom) => {
            println!("Format:   {:?}", d.sbom_metadata()?.format);
        }
        Ok(DataType::OciBlob) | Ok(DataType::OciRootIndex) => {
            println!("Digest:   {}", d.oci_blob_digest()?);
        }
        _ => {}
    }
    image.unload()?;
    Ok(())
}

fn cmd_dump(sub: &ArgMatches) -> Result<()> {
    let image = FileImage::load(file_arg(sub), LoadOpts::new().read_only(true))?;
    let d = image.get_descriptor(&[with_id(id_arg(sub)?)])?;
    io::copy(&mut d.reader(), &mut io::stdout().lock())?;
    image.unload()?;
    Ok(())
}

fn parse_data_type(s: &str) -> Result<DataType> {
    Ok(match s {
        "deffile" => DataType::Deffile,
        "envvar" => DataType::EnvVar,
        "labels" => DataType::Labels,
        "partition" => DataType::Partition,
        "signature" => DataType::Signature,
        "genericjson" => DataType::GenericJson,
        "generic" => DataType::Generic,
        "cryptomessage" => DataType::CryptoMessage,
        "sbom" => DataType::Sbom,
        "ocirootindex" => DataType::OciRootIndex,
        "ociblob" => DataType::OciBlob,
        other => bail!("unknown data type {:?}", other),
    })
}

fn parse_fs_type(s: &str) -> Result<FsType> {
    Ok(match s {
        "squashfs" => FsType::Squashfs,
        "ext3" => FsType::Ext3,
        "immuobj" => FsType::ImmutableObject,
        "raw" => FsType::Raw,
        "encryptsquashfs" => FsType::EncryptedSquashfs,
        other => bail!("unknown fs type {:?}", other),
    })
}

fn parse_part_type(s: &str) -> Result<PartType> {
    Ok(match s {
        "system" => PartType::System,
        "primsys" => PartType::PrimarySystem,
        "data" => PartType::Data,
        "overlay" => PartType::Overlay,
        other => bail!("unknown partition type {:?}", other),
    })
}

fn cmd_add(sub: &ArgMatches) -> Result<()> {
    let data_type = parse_data_type(sub.get_one::<String>("datatype").unwrap())?;
    let source = sub.get_one::<String>("input").unwrap();
    let reader: Box<dyn Read> = if source == "-" {
        Box::new(io::stdin())
    } else {
        Box::new(File::open(source)?)
    };

    let mut input = DescriptorInput::new(data_type, reader);
    if let Some(name) = sub.get_one::<String>("name") {
        input = input.with_name(name)?;
    }
    if sub.get_flag("nogroup") {
        input = input.with_no_group();
    } else if let Some(gid) = sub.get_one::<String>("groupid") {
        input = input.with_group_id(gid.parse()?)?;
    }
    if let Some(id) = sub.get_one::<String>("link") {
        input = input.with_linked_id(id.parse()?)?;
    } else if let Some(gid) = sub.get_one::<String>("linkgroup") {
        input = input.with_linked_group_id(gid.parse()?)?;
    }
    if let Some(alignment) = sub.get_one::<String>("alignment") {
        input = input.with_alignment(alignment.parse()?);
    }
    if data_type == DataType::Partition {
        let fs_type = sub
            .get_one::<String>("fstype")
            .ok_or_else(|| anyhow!("partition requires --fstype"))?;
        let part_type = sub
            .get_one::<String>("parttype")
            .ok_or_else(|| anyhow!("partition requires --parttype"))?;
        let arch = sub
            .get_one::<String>("arch")
            .ok_or_else(|| anyhow!("partition requires --arch"))?;
        input = input.with_partition_metadata(
            parse_fs_type(fs_type)?,
            parse_part_type(part_type)?,
            Arch::from_name(arch).ok_or_else(|| anyhow!("unknown arch {:?}", arch))?,
        )?;
    }

    let mut image = FileImage::load(file_arg(sub), LoadOpts::new())?;
    let id = image.add(input, AddOpts::new())?;
    info!("added object {}", id);
    image.unload()?;
    Ok(())
}

fn cmd_del(sub: &ArgMatches) -> Result<()> {
    let mut opts = DeleteOpts::new();
    if sub.get_flag("zero") {
        opts = opts.zero();
    }
    if sub.get_flag("compact") {
        opts = opts.compact();
    }
    let mut image = FileImage::load(file_arg(sub), LoadOpts::new())?;
    image.delete(id_arg(sub)?, opts)?;
    image.unload()?;
    Ok(())
}

fn cmd_setprim(sub: &ArgMatches) -> Result<()> {
    let mut image = FileImage::load(file_arg(sub), LoadOpts::new())?;
    image.set_primary_partition(id_arg(sub)?, SetOpts::new())?;
    image.unload()?;
    Ok(())
}
