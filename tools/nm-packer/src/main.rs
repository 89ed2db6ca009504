//! # NM Packer
//!
//! 资源打包工具：把资源目录打包为 `.nmpack` 文件，并可列出、校验已有的包。
//!
//! ## 用法
//!
//! ```bash
//! cargo run -p nm-packer -- build assets -o base.nmpack --compress
//! cargo run -p nm-packer -- build dlc -o dlc.nmpack --id summer --depends base \
//!     --encrypt-key-hex <64 hex> --sign-key private.pem
//! cargo run -p nm-packer -- list base.nmpack
//! cargo run -p nm-packer -- verify dlc.nmpack --public-key public.pem --key-hex <64 hex>
//! cargo run -p nm-packer -- keygen --out keys
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use nm_host::crypto::{self, AesKey};
use nm_host::vfs::keys::read_public_key;
use nm_host::vfs::{
    PackBuildOptions, PackBuilder, PackDependency, PackManifest, PackOpenOptions, PackReader,
};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "nmpack")]
#[command(about = "资源打包工具 - 将资源目录打包为 .nmpack 文件")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 打包目录
    Build {
        /// 资源目录
        input: PathBuf,

        /// 输出文件
        #[arg(short, long, default_value = "game.nmpack")]
        output: PathBuf,

        /// 压缩资源（仅在变小时生效）
        #[arg(short, long)]
        compress: bool,

        /// AES-256 密钥（64 位十六进制）
        #[arg(long)]
        encrypt_key_hex: Option<String>,

        /// Ed25519 私钥（PKCS#8 PEM）
        #[arg(long)]
        sign_key: Option<PathBuf>,

        /// 包 id（默认取输出文件名）
        #[arg(long)]
        id: Option<String>,

        #[arg(long, default_value = "1.0.0")]
        version: String,

        /// 依赖的包 id，可写作 `id` 或 `id@最低版本`
        #[arg(long = "depends")]
        depends: Vec<String>,
    },

    /// 列出包内容
    List {
        pack: PathBuf,

        /// 解密用的 AES-256 密钥
        #[arg(long)]
        key_hex: Option<String>,
    },

    /// 校验签名与每个资源的完整性
    Verify {
        pack: PathBuf,

        /// Ed25519 公钥（PEM），提供时要求包已签名
        #[arg(long)]
        public_key: Option<PathBuf>,

        #[arg(long)]
        key_hex: Option<String>,
    },

    /// 生成签名密钥对与 AES 密钥
    Keygen {
        /// 输出目录
        #[arg(short, long, default_value = "keys")]
        out: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    nm_host::logging::init("info");

    let result = match cli.command {
        Commands::Build {
            input,
            output,
            compress,
            encrypt_key_hex,
            sign_key,
            id,
            version,
            depends,
        } => build_pack(BuildArgs {
            input,
            output,
            compress,
            encrypt_key_hex,
            sign_key,
            id,
            version,
            depends,
        }),
        Commands::List { pack, key_hex } => list_pack(&pack, key_hex.as_deref()),
        Commands::Verify {
            pack,
            public_key,
            key_hex,
        } => verify_pack(&pack, public_key.as_deref(), key_hex.as_deref()),
        Commands::Keygen { out } => keygen(&out),
    };

    if let Err(e) = result {
        eprintln!("❌ {:#}", e);
        std::process::exit(1);
    }
}

struct BuildArgs {
    input: PathBuf,
    output: PathBuf,
    compress: bool,
    encrypt_key_hex: Option<String>,
    sign_key: Option<PathBuf>,
    id: Option<String>,
    version: String,
    depends: Vec<String>,
}

fn parse_dependency(arg: &str) -> PackDependency {
    match arg.split_once('@') {
        Some((id, min)) => PackDependency {
            min_version: Some(min.to_string()),
            ..PackDependency::required(id)
        },
        None => PackDependency::required(arg),
    }
}

fn build_pack(args: BuildArgs) -> Result<()> {
    if !args.input.is_dir() {
        bail!("输入目录不存在: {}", args.input.display());
    }
    println!("📦 打包资源目录: {} -> {}", args.input.display(), args.output.display());

    let id = match args.id {
        Some(id) => id,
        None => args
            .output
            .file_stem()
            .and_then(|s| s.to_str())
            .context("无法从输出文件名推断包 id，请使用 --id")?
            .to_string(),
    };
    let mut manifest = PackManifest::new(id);
    manifest.version = args.version;
    manifest.dependencies = args.depends.iter().map(|d| parse_dependency(d)).collect();

    let aes_key = args
        .encrypt_key_hex
        .as_deref()
        .map(AesKey::from_hex)
        .transpose()
        .context("AES 密钥无效")?;
    let signing_key = match &args.sign_key {
        Some(path) => {
            let pem = fs::read_to_string(path).with_context(|| format!("读取私钥 {}", path.display()))?;
            Some(crypto::signing_key_from_pem(&pem).context("私钥无效")?)
        }
        None => None,
    };

    let mut builder = PackBuilder::new(PackBuildOptions {
        compress: args.compress,
        aes_key,
        signing_key,
        manifest: Some(manifest),
    });

    let mut total_size = 0u64;
    for entry in WalkDir::new(&args.input).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(&args.input)?;
        let name = relative.to_string_lossy().replace('\\', "/");
        let data = fs::read(entry.path())
            .with_context(|| format!("读取 {}", entry.path().display()))?;
        total_size += data.len() as u64;
        println!("  + {} ({} bytes)", name, data.len());
        builder.add(&name, data);
    }
    if builder.is_empty() {
        bail!("输入目录中没有文件");
    }

    let built = builder.write_to(&args.output)?;
    println!();
    println!("✅ 打包完成！");
    println!("   资源数: {}", built.resource_count);
    println!("   原始大小: {:.2} MB", total_size as f64 / 1024.0 / 1024.0);
    println!("   包大小: {:.2} MB", built.bytes.len() as f64 / 1024.0 / 1024.0);
    if built.signature.is_some() {
        println!("   签名: {}.sig", args.output.display());
    }
    Ok(())
}

fn open_pack(path: &Path, public_key: Option<&Path>, key_hex: Option<&str>) -> Result<PackReader> {
    let aes_key = key_hex.map(AesKey::from_hex).transpose().context("AES 密钥无效")?;
    let public_key = public_key.map(read_public_key).transpose()?;
    let options = PackOpenOptions {
        require_signature: public_key.is_some(),
        aes_key,
        public_key,
        ..PackOpenOptions::default()
    };
    PackReader::open(path, &options).with_context(|| format!("打开 {}", path.display()))
}

fn list_pack(path: &Path, key_hex: Option<&str>) -> Result<()> {
    let reader = open_pack(path, None, key_hex)?;
    let manifest = reader.manifest();
    println!("📋 {} v{} ({})", manifest.id, manifest.version, path.display());
    for dep in &manifest.dependencies {
        println!(
            "   依赖: {}{}{}",
            dep.id,
            dep.min_version.as_deref().map(|v| format!(" >= {v}")).unwrap_or_default(),
            if dep.optional { "（可选）" } else { "" }
        );
    }
    println!();

    let mut stored_total = 0u64;
    let mut raw_total = 0u64;
    for id in reader.resource_ids() {
        let Some(entry) = reader.entry(id) else { continue };
        stored_total += entry.compressed_size;
        raw_total += entry.uncompressed_size;
        let mut flags = String::new();
        if entry.is_compressed() {
            flags.push('Z');
        }
        if entry.is_encrypted() {
            flags.push('E');
        }
        println!(
            "  {:<48} {:>10} {:>10} {:<10} {:>2}",
            id,
            entry.uncompressed_size,
            entry.compressed_size,
            entry.resource_type.name(),
            flags
        );
    }
    println!();
    println!(
        "共 {} 个资源，原始 {} 字节，存储 {} 字节",
        reader.resource_ids().len(),
        raw_total,
        stored_total
    );
    Ok(())
}

fn verify_pack(path: &Path, public_key: Option<&Path>, key_hex: Option<&str>) -> Result<()> {
    println!("🔍 校验 {}", path.display());
    let reader = open_pack(path, public_key, key_hex)?;
    for warning in reader.warnings() {
        println!("  ⚠️ {}", warning);
    }
    if public_key.is_some() {
        println!("  ✓ 签名有效");
    }

    let mut failures = 0usize;
    for id in reader.resource_ids() {
        if let Err(e) = reader.read(id) {
            println!("  ❌ {}: {}", id, e);
            failures += 1;
        }
    }
    if failures > 0 {
        bail!("{} / {} 个资源校验失败", failures, reader.resource_ids().len());
    }
    println!("✅ {} 个资源全部通过校验", reader.resource_ids().len());
    Ok(())
}

fn keygen(out: &Path) -> Result<()> {
    fs::create_dir_all(out).with_context(|| format!("创建 {}", out.display()))?;
    let signing_key = crypto::generate_signing_key();
    let private_pem = crypto::signing_key_to_pem(&signing_key)?;
    let public_pem = crypto::public_key_to_pem(&signing_key.verifying_key())?;
    let aes_key = AesKey::generate();

    let private_path = out.join("private.pem");
    let public_path = out.join("public.pem");
    let aes_path = out.join("aes.key");
    fs::write(&private_path, private_pem)?;
    fs::write(&public_path, public_pem)?;
    fs::write(&aes_path, aes_key.as_bytes())?;

    println!("🔑 已生成密钥");
    println!("   私钥: {}", private_path.display());
    println!("   公钥: {}", public_path.display());
    println!("   AES: {}（十六进制 {}）", aes_path.display(), hex::encode(aes_key.as_bytes()));
    Ok(())
}
