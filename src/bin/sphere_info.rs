use wavesphere::{MemFlash, Settings, SphereStore, WtManager, FLASH_SECTOR_SIZE};

use flexi_logger::{Logger, opt_format};

// Usage: sphere_info [flash image] [settings.json]
//
// Restores the factory spheres in the flash image, writes the image back
// and prints the state of all slots as JSON. Without an image an erased
// flash is used.
fn main () {
    Logger::with_env_or_str("sphere_info=debug, wavesphere=info")
                            .log_to_file()
                            .directory("log_files")
                            .format(opt_format)
                            .start()
                            .unwrap();

    let image_file = std::env::args().nth(1);
    let settings = match std::env::args().nth(2) {
        Some(filename) => Settings::load(&filename).expect("Unable to load settings"),
        None => Settings::default(),
    };

    let image_size = SphereStore::<MemFlash>::flash_size(settings.flash_base_address);
    let flash = match &image_file {
        Some(filename) if std::path::Path::new(filename).exists() => {
            MemFlash::load_file(filename, image_size, FLASH_SECTOR_SIZE).expect("Unable to load flash image")
        }
        _ => MemFlash::new(image_size, FLASH_SECTOR_SIZE),
    };

    let mut manager = WtManager::new(flash, &settings);
    let restored = manager.restore_factory_spheres();
    println!("Restored {} factory spheres", restored);

    if let Some(filename) = &image_file {
        if manager.store().flash().save_file(filename).is_err() {
            println!("Failed to write flash image");
        }
    }

    let info = manager.slot_info();
    println!("{}", serde_json::to_string_pretty(&info).unwrap());
}
